//! ClassBell bot: transformer, sweep, delivery workers and chat commands in one process.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;

use classbell_common::broker::RedisBroker;
use classbell_common::config::AppConfig;
use classbell_common::db;
use classbell_engine::registry::PgRecipientRegistry;
use classbell_engine::store::PgEventStore;
use classbell_notifier::transport::{ChatTransport, TelegramTransport};
use classbell_notifier::worker::DeliveryWorker;

use classbell_bot::commands::CommandHandler;
use classbell_bot::runtime::{Pipeline, run_command_loop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "classbell_bot=info,classbell_engine=info,classbell_notifier=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("ClassBell bot starting...");

    // Load configuration
    let config = AppConfig::from_env()?;
    let token = config
        .telegram_bot_token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN environment variable is required"))?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    // Connect to broker and chat transport
    let broker = Arc::new(
        RedisBroker::connect(&config.redis_url, config.pipeline.broker_visibility_timeout).await?,
    );
    let transport = Arc::new(
        TelegramTransport::connect(
            &config.telegram_api_base,
            &token,
            config.pipeline.send_timeout,
        )
        .await?,
    );

    let store = Arc::new(PgEventStore::new(pool.clone()));
    let registry = Arc::new(PgRecipientRegistry::new(pool));
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        registry.clone(),
        broker.clone(),
        config.pipeline.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let pipeline = pipeline.clone();
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { pipeline.run_transform_loop(rx).await });
    }
    {
        let pipeline = pipeline.clone();
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { pipeline.run_sweep_loop(rx).await });
    }

    for i in 0..config.pipeline.worker_concurrency {
        let worker = DeliveryWorker::new(
            format!("worker-{}-{}", std::process::id(), i),
            store.clone(),
            registry.clone(),
            broker.clone(),
            transport.clone(),
            config.pipeline.clone(),
        );
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { worker.run(rx).await });
    }

    {
        let handler = CommandHandler::new(store.clone());
        let transport = transport.clone();
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { run_command_loop(transport, handler, rx).await });
    }

    tracing::info!(
        workers = config.pipeline.worker_concurrency,
        "ClassBell bot running"
    );

    // Run until Ctrl+C or until a loop exits on its own
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
        Some(result) = tasks.join_next() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Pipeline task exited unexpectedly");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Pipeline task failed during shutdown");
        }
    }

    transport.disconnect().await;
    tracing::info!("ClassBell bot stopped.");
    Ok(())
}
