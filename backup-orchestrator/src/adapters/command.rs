//! Opaque external commands (dump, restore, save, check).

use crate::utils::errors::{OrchestratorError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

const STDERR_TAIL: usize = 512;

/// Run `argv` to completion.
///
/// `stdin_from` feeds a file on stdin, `stdout_to` captures stdout into a
/// file. A non-zero exit becomes [`OrchestratorError::Command`] carrying the
/// tail of stderr. The child is killed if the future is dropped (e.g. on
/// timeout).
pub async fn run_command(argv: &[String], stdin_from: Option<&Path>, stdout_to: Option<&Path>) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| OrchestratorError::Configuration("empty command".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true).stderr(Stdio::piped());

    match stdin_from {
        Some(path) => {
            cmd.stdin(std::fs::File::open(path)?);
        }
        None => {
            cmd.stdin(Stdio::null());
        }
    }
    match stdout_to {
        Some(path) => {
            cmd.stdout(std::fs::File::create(path)?);
        }
        None => {
            cmd.stdout(Stdio::null());
        }
    }

    debug!("Running command: {}", argv.join(" "));
    let output = cmd.output().await.map_err(|e| {
        OrchestratorError::Command(format!("failed to spawn '{}': {}", program, e))
    })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let tail = if stderr.len() > STDERR_TAIL {
        let mut start = stderr.len() - STDERR_TAIL;
        while !stderr.is_char_boundary(start) {
            start += 1;
        }
        &stderr[start..]
    } else {
        stderr
    };
    Err(OrchestratorError::Command(format!(
        "'{}' exited with {}: {}",
        program, output.status, tail
    )))
}
