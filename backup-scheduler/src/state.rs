use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::services::run_queue::RunQueue;
use backup_orchestrator::BackupOrchestrator;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub orchestrator: Arc<BackupOrchestrator>,
    pub queue: RunQueue,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig, orchestrator: Arc<BackupOrchestrator>, queue: RunQueue) -> Self {
        Self {
            db,
            config,
            orchestrator,
            queue,
            started_at: Instant::now(),
        }
    }
}
