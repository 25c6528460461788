mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::db::with_conn;
use crate::services::backup_scheduler::BackupScheduler;
use crate::services::run_queue::{RunQueue, RunWorker};
use crate::state::AppState;
use backup_orchestrator::config::Config;
use backup_orchestrator::daemon::ShutdownCoordinator;
use backup_orchestrator::BackupOrchestrator;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("Starting backup scheduler on port {}", config.port);

    let orchestrator_config = match &config.orchestrator_config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Run history
    let history_db = config
        .history_db
        .clone()
        .unwrap_or_else(|| orchestrator_config.storage.backup_root.join("history.db"));
    if let Some(parent) = history_db.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pool = create_pool(&history_db.to_string_lossy())?;
    migrate(&pool)?;
    let abandoned = with_conn(&pool, |conn| models::run_record::abandon_unfinished(conn)).await?;
    if abandoned > 0 {
        tracing::warn!("Marked {} unfinished run(s) from a previous process as cancelled", abandoned);
    }

    let orchestrator = Arc::new(BackupOrchestrator::from_config(&orchestrator_config)?);

    // Single worker behind a bounded queue
    let shutdown = ShutdownCoordinator::new();
    let (queue, rx) = RunQueue::new(pool.clone(), config.queue_capacity);
    let worker = RunWorker::new(pool.clone(), orchestrator.clone()).spawn(rx, shutdown.token());

    // Initialize cron scheduler
    let scheduler = BackupScheduler::new(queue.clone()).await?;
    scheduler
        .init_schedules(&config.backup_cron, config.prune_cron.as_deref())
        .await?;
    scheduler.start().await?;

    let state = Arc::new(AppState::new(pool.clone(), config.clone(), orchestrator, queue));
    let app = routes::create_router(state);

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let signals = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signals.wait_for_signal().await })
        .await?;

    // Cleanup
    tracing::info!("Shutting down...");
    shutdown.trigger();

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }

    match tokio::time::timeout(Duration::from_secs(60), worker).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Run worker panicked: {}", e),
        Err(_) => tracing::warn!("Run worker did not stop within 60s"),
    }

    db::connection::close_pool(&pool);
    tracing::info!("Scheduler stopped");

    Ok(())
}
