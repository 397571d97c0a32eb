//! ClassBell operator API binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use classbell_common::broker::RedisBroker;
use classbell_common::config::AppConfig;
use classbell_common::db::create_pool;
use classbell_engine::dispatcher::Dispatcher;
use classbell_engine::registry::PgRecipientRegistry;
use classbell_engine::store::PgEventStore;

use classbell_api::routes::create_router;
use classbell_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("classbell_api=debug,classbell_engine=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting ClassBell operator API...");

    // Load configuration
    let config = AppConfig::from_env()?;
    if config.ops_api_token.is_none() {
        tracing::warn!("OPS_API_TOKEN is not set; operator routes are unauthenticated");
    }

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;

    // Re-drive publishes through the same broker the workers consume
    let broker = Arc::new(
        RedisBroker::connect(&config.redis_url, config.pipeline.broker_visibility_timeout).await?,
    );

    // Build application state
    let store = Arc::new(PgEventStore::new(pool.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(PgRecipientRegistry::new(pool)),
        broker,
        config.pipeline.clone(),
    ));
    let state = AppState::new(store, dispatcher, config.ops_api_token.clone());

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
