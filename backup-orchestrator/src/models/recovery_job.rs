//! Recovery Job record and its state machine.

use super::backup_set::ComponentType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Requested,
    Validating,
    Restoring,
    Verifying,
    Completed,
    RolledBack,
    Failed,
}

impl RecoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStatus::Requested => "requested",
            RecoveryStatus::Validating => "validating",
            RecoveryStatus::Restoring => "restoring",
            RecoveryStatus::Verifying => "verifying",
            RecoveryStatus::Completed => "completed",
            RecoveryStatus::RolledBack => "rolled_back",
            RecoveryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryStatus::Completed | RecoveryStatus::RolledBack | RecoveryStatus::Failed
        )
    }

    /// Legal edges of the recovery state machine.
    pub fn can_transition_to(&self, next: RecoveryStatus) -> bool {
        use RecoveryStatus::*;
        matches!(
            (self, next),
            (Requested, Validating)
                | (Requested, Failed)
                | (Validating, Restoring)
                | (Validating, Failed)
                | (Restoring, Verifying)
                | (Restoring, RolledBack)
                | (Restoring, Failed)
                | (Verifying, Completed)
                | (Verifying, RolledBack)
                | (Verifying, Failed)
        )
    }
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single restore operation against one Backup Set. Never reused once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryJob {
    pub id: String,
    pub source_set_id: String,
    pub target_components: Vec<ComponentType>,
    pub status: RecoveryStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    /// Components whose live state was modified by this job.
    #[serde(default)]
    pub touched: Vec<ComponentType>,
}

impl RecoveryJob {
    pub fn new(source_set_id: &str, mut target_components: Vec<ComponentType>) -> Self {
        target_components.sort_by_key(|c| c.restore_rank());
        target_components.dedup();
        Self {
            id: Uuid::new_v4().to_string(),
            source_set_id: source_set_id.to_string(),
            target_components,
            status: RecoveryStatus::Requested,
            started_at: Utc::now(),
            completed_at: None,
            errors: Vec::new(),
            touched: Vec::new(),
        }
    }

    /// Move to `next`. Illegal edges and moves out of a terminal state are refused.
    pub fn transition(&mut self, next: RecoveryStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::error!(
                job_id = %self.id,
                from = %self.status,
                to = %next,
                "Refusing illegal recovery transition"
            );
            return false;
        }
        tracing::info!(job_id = %self.id, from = %self.status, to = %next, "Recovery transition");
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// CLI exit code: only a completed restore is a success.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RecoveryStatus::Completed => 0,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_sorts_targets_in_restore_order() {
        let job = RecoveryJob::new(
            "set-1",
            vec![ComponentType::Logs, ComponentType::Database, ComponentType::Config, ComponentType::Logs],
        );
        assert_eq!(
            job.target_components,
            vec![ComponentType::Config, ComponentType::Database, ComponentType::Logs]
        );
        assert_eq!(job.status, RecoveryStatus::Requested);
    }

    #[test]
    fn test_cannot_complete_without_verifying() {
        let mut job = RecoveryJob::new("set-1", vec![ComponentType::Database]);
        assert!(job.transition(RecoveryStatus::Validating));
        assert!(job.transition(RecoveryStatus::Restoring));
        assert!(!job.transition(RecoveryStatus::Completed));
        assert!(job.transition(RecoveryStatus::Verifying));
        assert!(job.transition(RecoveryStatus::Completed));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_terminal_jobs_are_never_reused() {
        let mut job = RecoveryJob::new("set-1", vec![ComponentType::Cache]);
        assert!(job.transition(RecoveryStatus::Validating));
        assert!(job.transition(RecoveryStatus::Failed));
        assert!(!job.transition(RecoveryStatus::Restoring));
        assert_eq!(job.status, RecoveryStatus::Failed);
        assert_eq!(job.exit_code(), 2);
    }
}
