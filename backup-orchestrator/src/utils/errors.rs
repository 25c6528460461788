//! Error taxonomy for the orchestrator.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Lock contention: {0}")]
    LockContention(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Displays as a bare `timeout` so component warnings read `"<name>: timeout"`.
    #[error("timeout")]
    Timeout(Duration),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl OrchestratorError {
    /// Whether a retry may succeed. Integrity failures are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::TransientIo(_)
            | OrchestratorError::Timeout(_)
            | OrchestratorError::Command(_)
            | OrchestratorError::Io(_) => true,
            OrchestratorError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Short kind label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Configuration(_) => "configuration",
            OrchestratorError::LockContention(_) => "lock_contention",
            OrchestratorError::TransientIo(_) => "transient_io",
            OrchestratorError::Integrity(_) => "integrity",
            OrchestratorError::Timeout(_) => "timeout",
            OrchestratorError::Command(_) => "command",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Service(_) => "service",
            OrchestratorError::Cancelled => "cancelled",
            OrchestratorError::Io(_) => "io",
            OrchestratorError::Serialization(_) => "serialization",
            OrchestratorError::Http(_) => "http",
            OrchestratorError::Database(_) => "database",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_reads_as_warning_text() {
        let err = OrchestratorError::Timeout(Duration::from_secs(900));
        assert_eq!(err.to_string(), "timeout");
        assert!(err.is_transient());
    }

    #[test]
    fn test_integrity_is_never_transient() {
        assert!(!OrchestratorError::Integrity("checksum mismatch".into()).is_transient());
        assert!(!OrchestratorError::LockContention("held".into()).is_transient());
        assert!(!OrchestratorError::Configuration("bad".into()).is_transient());
        assert!(OrchestratorError::TransientIo("reset".into()).is_transient());
    }
}
