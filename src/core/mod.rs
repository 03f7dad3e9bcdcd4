// Domain-layer modules and shared errors/models
pub mod contact {
    pub use crate::contact::*;
}

pub mod duplicates {
    pub use crate::duplicates::*;
}

pub mod events {
    pub use crate::events::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
