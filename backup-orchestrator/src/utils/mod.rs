//! Utility modules for the orchestrator.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{OrchestratorError, Result};
