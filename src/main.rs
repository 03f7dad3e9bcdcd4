use anyhow::anyhow;
use rust_leads_api::config::Config;
use rust_leads_api::db::Database;
use rust_leads_api::handlers::AppState;
use rust_leads_api::routes;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the application.
///
/// Initializes tracing, loads configuration, connects to Postgres (running
/// pending migrations), builds the shared state and serves the HTTP API and
/// the event socket until the process is stopped.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_leads_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    let app_state = Arc::new(AppState::new(db.pool.clone(), config.clone()));
    tracing::info!(
        "Event channel ready (capacity {}), privileged organization '{}'",
        config.event_channel_capacity,
        config.privileged_org_name
    );

    // Rate limiting per client IP
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(config.rate_limit_per_second)
            .burst_size(config.rate_limit_burst)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("Invalid rate limit configuration"))?,
    );

    let protected_routes = routes::api_routes().layer(GovernorLayer {
        config: governor_conf,
    });

    // Health check and socket bypass rate limiting
    let app = routes::app(app_state, protected_routes);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
