//! Backup Orchestrator Library
//!
//! Coordinated backup and disaster recovery for a stack of stores: a database,
//! a cache, a search index and plain directories, captured as one checksummed
//! set and restored with rollback.

pub mod adapters;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod lock;
pub mod manifest;
pub mod models;
pub mod offload;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod supervisor;
pub mod utils;
pub mod verifier;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::{BackupOrchestrator, RecoveryOrchestrator};
pub use utils::errors::{OrchestratorError, Result};
