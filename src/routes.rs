use crate::auth_handler;
use crate::handlers::{self, AppState};
use crate::organization_handler;
use crate::ws_handler;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

/// Request body limit: 1MB max payload.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Every `/api` route, without rate limiting or cross-cutting layers.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Auth & accounts
        .route("/api/auth/login", post(auth_handler::login))
        .route("/api/auth/register", post(auth_handler::register))
        .route("/api/auth/logout", post(auth_handler::logout))
        .route("/api/auth/me", get(auth_handler::me))
        .route("/api/auth/profile", put(auth_handler::update_profile))
        .route("/api/auth/change-password", put(auth_handler::change_password))
        .route("/api/auth/agents", get(auth_handler::list_agents))
        .route(
            "/api/auth/agents/:id",
            put(auth_handler::update_agent).delete(auth_handler::delete_agent),
        )
        .route("/api/auth/admins", get(auth_handler::list_admins))
        .route(
            "/api/auth/admins/:id",
            put(auth_handler::update_admin).delete(auth_handler::delete_admin),
        )
        .route("/api/auth/users/:id", put(auth_handler::update_user))
        // Leads
        .route(
            "/api/leads",
            get(handlers::list_leads).post(handlers::create_lead),
        )
        .route("/api/leads/available-agents", get(handlers::available_agents))
        .route("/api/leads/dashboard/stats", get(handlers::dashboard_stats))
        .route(
            "/api/leads/:id",
            get(handlers::get_lead)
                .put(handlers::update_lead)
                .delete(handlers::delete_lead),
        )
        .route("/api/leads/:id/assign", post(handlers::assign_lead))
        .route("/api/leads/:id/unassign", post(handlers::unassign_lead))
        // Organizations
        .route(
            "/api/organizations",
            get(organization_handler::list_organizations)
                .post(organization_handler::create_organization),
        )
        .route(
            "/api/organizations/:id",
            get(organization_handler::get_organization)
                .put(organization_handler::update_organization)
                .delete(organization_handler::delete_organization),
        )
}

/// Full application: health and socket endpoints merged with `api`, which
/// the caller may have wrapped in a rate limiter first. Health bypasses both
/// the limiter and the request timeout.
pub fn app(state: Arc<AppState>, api: Router<Arc<AppState>>) -> Router {
    let timeout = Duration::from_secs(state.config.request_timeout_secs);

    let api = api.layer(
        ServiceBuilder::new()
            .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
            .layer(TimeoutLayer::new(timeout)),
    );

    Router::new()
        .route("/health", get(handlers::health))
        .route("/socket", get(ws_handler::socket_handler))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
