//! Retention: which sets to delete, and deleting them without ever exposing
//! a half-removed set.

use super::{scan_sets, TOMBSTONE_PREFIX};
use crate::config::RetentionConfig;
use crate::utils::errors::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
    pub pinned_set_ids: Vec<String>,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            max_age_days: config.max_age_days,
            pinned_set_ids: config.pinned.clone(),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&RetentionConfig::default())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub dry_run: bool,
    pub deleted: Vec<String>,
    pub retained: Vec<String>,
    /// Manifest-less directories removed (or that would be removed)
    pub orphans: Vec<String>,
    /// Deletions that failed, as `"{id}: {error}"`; the rest still ran
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<String>,
}

impl PruneReport {
    /// 1 when any deletion failed, otherwise 0.
    pub fn exit_code(&self) -> i32 {
        if self.failed.is_empty() {
            0
        } else {
            1
        }
    }

    fn record_failure(&mut self, id: &str, error: impl std::fmt::Display) {
        warn!(set_id = id, "Cannot delete: {}", error);
        self.failed.push(format!("{}: {}", id, error));
    }
}

/// Apply `policy` to every set under `sets_dir`.
///
/// A set older than `max_age_days` is deleted unless it is pinned or it is
/// the most recent restorable set. With `dry_run` nothing is touched and the
/// report says what would have happened. A deletion that fails is recorded
/// in [`PruneReport::failed`] and the remaining candidates are still handled.
pub fn prune(sets_dir: &Path, policy: &RetentionPolicy, now: DateTime<Utc>, dry_run: bool) -> Result<PruneReport> {
    let scan = scan_sets(sets_dir)?;
    let cutoff = now - Duration::days(i64::from(policy.max_age_days));
    let newest_restorable = scan
        .sets
        .iter()
        .find(|s| s.status.is_restorable())
        .map(|s| s.id.clone());

    let mut report = PruneReport {
        dry_run,
        ..PruneReport::default()
    };

    if !dry_run {
        for tombstone in &scan.tombstones {
            warn!("Finishing interrupted deletion of {}", tombstone.display());
            if let Err(e) = std::fs::remove_dir_all(tombstone) {
                report.record_failure(&tombstone.display().to_string(), e);
            }
        }
    }

    for set in &scan.sets {
        let pinned = policy.pinned_set_ids.iter().any(|p| p == &set.id);
        let newest = newest_restorable.as_deref() == Some(set.id.as_str());
        if set.created_at >= cutoff || pinned || newest {
            report.retained.push(set.id.clone());
            continue;
        }

        if !dry_run {
            if let Err(e) = delete_set_dir(set.set_dir(), &set.id) {
                report.record_failure(&set.id, e);
                continue;
            }
            info!(set_id = %set.id, status = %set.status, "Pruned backup set");
        }
        report.deleted.push(set.id.clone());
    }

    // Unreadable manifests are kept for a human to look at.
    for (path, _) in &scan.unreadable {
        if let Some(name) = path.file_name() {
            report.retained.push(name.to_string_lossy().into_owned());
        }
    }

    for orphan in &scan.orphans {
        let name = orphan
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !dry_run {
            if let Err(e) = delete_set_dir(orphan, &name) {
                report.record_failure(&name, e);
                continue;
            }
            info!("Removed orphaned set directory {}", orphan.display());
        }
        report.orphans.push(name);
    }

    Ok(report)
}

/// Rename to a hidden tombstone first, then delete the tombstone.
fn delete_set_dir(dir: &Path, id: &str) -> Result<()> {
    let tombstone: PathBuf = dir.with_file_name(format!("{}{}", TOMBSTONE_PREFIX, id));
    std::fs::rename(dir, &tombstone)?;
    std::fs::remove_dir_all(&tombstone)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::list_sets;
    use crate::manifest::testing::sample_set;
    use crate::models::SetStatus;
    use tempfile::TempDir;

    fn policy(days: u32) -> RetentionPolicy {
        RetentionPolicy {
            max_age_days: days,
            pinned_set_ids: Vec::new(),
        }
    }

    /// Ten sets one day apart, the newest `now - 1 day`.
    fn ten_sets(dir: &Path, now: DateTime<Utc>, statuses: &[SetStatus; 10]) -> Vec<String> {
        (0..10)
            .map(|i| sample_set(dir, now - Duration::days(10 - i as i64), statuses[i]).id)
            .collect()
    }

    #[test]
    fn test_deletes_exactly_the_eligible_sets() {
        let tmp = TempDir::new().unwrap();
        let now = Utc::now();
        let ids = ten_sets(tmp.path(), now, &[SetStatus::Success; 10]);

        // Sets aged 10..=3 days are older than the 2.5 day cutoff; the two newest are not.
        let report = prune(tmp.path(), &policy(2), now - Duration::hours(12), false).unwrap();
        assert_eq!(report.deleted.len(), 8);
        assert_eq!(report.retained.len(), 2);
        for id in &ids[..8] {
            assert!(report.deleted.contains(id));
        }

        let remaining: Vec<_> = list_sets(tmp.path()).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(remaining, vec![ids[9].clone(), ids[8].clone()]);
    }

    #[test]
    fn test_keeps_most_recent_successful_set_even_when_eligible() {
        let tmp = TempDir::new().unwrap();
        let now = Utc::now();
        let mut statuses = [SetStatus::Failed; 10];
        statuses[0] = SetStatus::Success;
        statuses[3] = SetStatus::PartialSuccess;
        let ids = ten_sets(tmp.path(), now, &statuses);

        // Everything is past the cutoff.
        let report = prune(tmp.path(), &policy(0), now, false).unwrap();
        assert_eq!(report.retained, vec![ids[3].clone()]);
        assert_eq!(report.deleted.len(), 9);
        assert_eq!(list_sets(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_pinned_sets_survive() {
        let tmp = TempDir::new().unwrap();
        let now = Utc::now();
        let ids = ten_sets(tmp.path(), now, &[SetStatus::Success; 10]);

        let policy = RetentionPolicy {
            max_age_days: 0,
            pinned_set_ids: vec![ids[0].clone()],
        };
        let report = prune(tmp.path(), &policy, now, false).unwrap();
        assert!(report.retained.contains(&ids[0]));
        assert!(report.retained.contains(&ids[9]));
        assert_eq!(report.deleted.len(), 8);
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let tmp = TempDir::new().unwrap();
        let now = Utc::now();
        ten_sets(tmp.path(), now, &[SetStatus::Success; 10]);
        std::fs::create_dir_all(tmp.path().join("20200101-000000-000")).unwrap();

        let report = prune(tmp.path(), &policy(0), now, true).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.deleted.len(), 9);
        assert_eq!(report.orphans, vec!["20200101-000000-000".to_string()]);
        assert_eq!(list_sets(tmp.path()).unwrap().len(), 10);
        assert!(tmp.path().join("20200101-000000-000").exists());
    }

    #[test]
    fn test_failed_deletion_does_not_stop_the_prune() {
        let tmp = TempDir::new().unwrap();
        let now = Utc::now();
        let ids = ten_sets(tmp.path(), now, &[SetStatus::Success; 10]);
        // A stray file where the tombstone directory must go blocks one rename.
        std::fs::write(tmp.path().join(format!("{}{}", TOMBSTONE_PREFIX, ids[2])), b"").unwrap();

        let report = prune(tmp.path(), &policy(0), now, false).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.exit_code(), 1);
        assert!(report.failed[0].starts_with(&ids[2]));
        assert_eq!(report.deleted.len(), 8);
        assert!(!report.deleted.contains(&ids[2]));

        let remaining: Vec<_> = list_sets(tmp.path()).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(remaining, vec![ids[9].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_removes_orphans_and_tombstones() {
        let tmp = TempDir::new().unwrap();
        let now = Utc::now();
        let kept = sample_set(tmp.path(), now, SetStatus::Success);
        std::fs::create_dir_all(tmp.path().join("20200101-000000-000/partial")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".pruning-20190101-000000-000")).unwrap();

        let report = prune(tmp.path(), &policy(14), now, false).unwrap();
        assert_eq!(report.retained, vec![kept.id]);
        assert_eq!(report.orphans.len(), 1);
        let left: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(left.len(), 1);
    }
}
