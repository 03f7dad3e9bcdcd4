// Thin namespace wrapper for API-layer components
pub mod handlers {
    pub use crate::handlers::*;
}

pub mod auth_handler {
    pub use crate::auth_handler::*;
}

pub mod organization_handler {
    pub use crate::organization_handler::*;
}

pub mod ws_handler {
    pub use crate::ws_handler::*;
}

pub mod routes {
    pub use crate::routes::*;
}
