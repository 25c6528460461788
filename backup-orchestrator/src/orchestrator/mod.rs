//! Backup and recovery orchestration.

pub mod backup;
pub mod recovery;

pub use backup::BackupOrchestrator;
pub use recovery::{load_jobs, RecoveryOrchestrator};

use crate::config::Config;
use crate::lock::{FileRunLock, LockInfo, RunLock};
use crate::manifest::list_sets;
use crate::models::{BackupSet, RecoveryJob};
use crate::utils::errors::Result;
use serde::Serialize;

/// What `status` reports: who holds the lock and the latest outcomes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub lock: Option<LockInfo>,
    pub latest_set: Option<BackupSet>,
    pub latest_recovery: Option<RecoveryJob>,
}

impl StatusReport {
    /// Read-only; never takes the run lock.
    pub fn collect(config: &Config) -> Result<Self> {
        let lock = FileRunLock::new(config.lock_path(), config.lock_ttl())
            .holder()
            .unwrap_or(None);
        Ok(Self {
            lock,
            latest_set: list_sets(&config.sets_dir())?.into_iter().next(),
            latest_recovery: load_jobs(&config.recovery_dir())?.into_iter().next(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::testing::sample_set;
    use crate::models::SetStatus;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    #[test]
    fn test_status_reports_newest_set_and_idle_lock() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.backup_root = tmp.path().to_path_buf();

        let empty = StatusReport::collect(&config).unwrap();
        assert!(empty.lock.is_none() && empty.latest_set.is_none() && empty.latest_recovery.is_none());

        sample_set(&config.sets_dir(), Utc::now() - Duration::days(1), SetStatus::Success);
        let newest = sample_set(&config.sets_dir(), Utc::now(), SetStatus::PartialSuccess);

        let report = StatusReport::collect(&config).unwrap();
        assert_eq!(report.latest_set.unwrap().id, newest.id);
    }
}
