//! Records produced and consumed by the orchestrators.

pub mod backup_set;
pub mod recovery_job;

pub use backup_set::{BackupSet, ComponentBackup, ComponentType, OffloadState, SetStatus};
pub use recovery_job::{RecoveryJob, RecoveryStatus};
