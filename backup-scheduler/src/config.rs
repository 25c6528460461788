use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Orchestrator TOML; defaults apply when unset
    pub orchestrator_config: Option<PathBuf>,
    /// Six-field cron (with seconds) for backup runs
    pub backup_cron: String,
    pub prune_cron: Option<String>,
    /// Run history database; defaults to `{backup_root}/history.db`
    pub history_db: Option<PathBuf>,
    /// Runs waiting behind the one in flight
    pub queue_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(9980),
            orchestrator_config: std::env::var("ORCHESTRATOR_CONFIG").ok().map(PathBuf::from),
            backup_cron: std::env::var("BACKUP_CRON").unwrap_or_else(|_| "0 0 3 * * *".into()),
            prune_cron: std::env::var("PRUNE_CRON").ok().filter(|v| !v.trim().is_empty()),
            history_db: std::env::var("HISTORY_DB").ok().map(PathBuf::from),
            queue_capacity: std::env::var("QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(4),
        }
    }
}
