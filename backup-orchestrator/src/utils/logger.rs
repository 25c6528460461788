//! Logging for `backupctl`.
//!
//! A bare level such as `debug` applies to this crate only; cloud SDK and
//! HTTP client chatter stays at `warn`. A full directive string
//! (`backup_orchestrator=trace,aws_config=info`) or `RUST_LOG` is used as given.

use super::errors::{OrchestratorError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Filter directives for the configured `level`.
pub fn directives(level: &str) -> Result<String> {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        return Ok(level.to_string());
    }
    let level = level.to_ascii_lowercase();
    if !LEVELS.contains(&level.as_str()) {
        return Err(OrchestratorError::Configuration(format!(
            "unknown log level '{}' (expected one of {})",
            level,
            LEVELS.join(", ")
        )));
    }
    Ok(format!("warn,backup_orchestrator={0},backupctl={0}", level))
}

/// Install the global subscriber. Log lines go to stderr so the tables
/// printed on stdout stay machine-readable.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives(level)?)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;

    Ok(())
}
