//! Bounded run queue and the single worker that drains it.
//!
//! Cron ticks and API calls only enqueue; one worker executes runs through
//! the orchestrator, so at most one run is in flight per process. The run lock
//! still arbitrates against other processes (a `backupctl` in a shell).

use crate::db::connection::DbPool;
use crate::db::with_conn;
use crate::error::AppError;
use crate::models::run_record::{self, RunKind, RunOutcome, RunRecord, Trigger};
use backup_orchestrator::models::BackupSet;
use backup_orchestrator::{BackupOrchestrator, OrchestratorError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct QueuedRun {
    pub run_id: String,
    pub kind: RunKind,
}

#[derive(Clone)]
pub struct RunQueue {
    tx: mpsc::Sender<QueuedRun>,
    db: DbPool,
}

impl RunQueue {
    pub fn new(db: DbPool, capacity: usize) -> (Self, mpsc::Receiver<QueuedRun>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, db }, rx)
    }

    /// Record a queued run and hand it to the worker. A full queue records the
    /// run as skipped.
    pub async fn enqueue(&self, kind: RunKind, trigger: Trigger) -> Result<RunRecord, AppError> {
        let record = with_conn(&self.db, move |conn| run_record::create(conn, kind, trigger)).await?;

        let queued = QueuedRun {
            run_id: record.id.clone(),
            kind,
        };
        match self.tx.try_send(queued) {
            Ok(()) => {
                tracing::info!(run_id = %record.id, kind = kind.as_str(), trigger = trigger.as_str(), "Run queued");
                Ok(record)
            }
            Err(e) => {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "run queue is full",
                    mpsc::error::TrySendError::Closed(_) => "run worker has stopped",
                };
                tracing::warn!(run_id = %record.id, kind = kind.as_str(), "Run skipped: {}", reason);
                let id = record.id.clone();
                with_conn(&self.db, move |conn| {
                    run_record::finish(
                        conn,
                        &id,
                        &RunOutcome {
                            status: "skipped".into(),
                            message: Some(reason.into()),
                            ..Default::default()
                        },
                    )
                })
                .await?;
                Err(AppError::ServiceUnavailable(reason.into()))
            }
        }
    }
}

pub struct RunWorker {
    db: DbPool,
    orchestrator: Arc<BackupOrchestrator>,
}

impl RunWorker {
    pub fn new(db: DbPool, orchestrator: Arc<BackupOrchestrator>) -> Self {
        Self { db, orchestrator }
    }

    /// Drain `rx` until `cancel` fires. The in-flight run sees the same token
    /// and stops at its next checkpoint; runs still queued are recorded as
    /// cancelled.
    pub fn spawn(self, mut rx: mpsc::Receiver<QueuedRun>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let run = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(run) => run,
                        None => break,
                    },
                };
                self.execute(run, &cancel).await;
            }

            rx.close();
            while let Ok(run) = rx.try_recv() {
                self.record(
                    &run.run_id,
                    RunOutcome {
                        status: "cancelled".into(),
                        message: Some("scheduler shutting down".into()),
                        ..Default::default()
                    },
                )
                .await;
            }
            tracing::info!("Run worker stopped");
        })
    }

    async fn execute(&self, run: QueuedRun, cancel: &CancellationToken) {
        let id = run.run_id.clone();
        if let Err(e) = with_conn(&self.db, move |conn| run_record::mark_running(conn, &id)).await {
            tracing::warn!(run_id = %run.run_id, "Cannot mark run as running: {e:#}");
        }
        tracing::info!(run_id = %run.run_id, kind = run.kind.as_str(), "Run started");

        let outcome = match run.kind {
            RunKind::Backup => backup_outcome(self.orchestrator.run_backup(cancel).await),
            RunKind::Prune => {
                let orchestrator = self.orchestrator.clone();
                let result = tokio::task::spawn_blocking(move || orchestrator.prune(false))
                    .await
                    .unwrap_or_else(|e| Err(OrchestratorError::TransientIo(format!("prune task failed: {}", e))));
                match result {
                    Ok(report) => RunOutcome {
                        status: if report.failed.is_empty() { "success" } else { "partial_success" }.into(),
                        exit_code: Some(i64::from(report.exit_code())),
                        message: Some(if report.failed.is_empty() {
                            format!("deleted {}, retained {}", report.deleted.len(), report.retained.len())
                        } else {
                            format!(
                                "deleted {}, retained {}, failed: {}",
                                report.deleted.len(),
                                report.retained.len(),
                                report.failed.join("; ")
                            )
                        }),
                        ..Default::default()
                    },
                    Err(e) => error_outcome(e),
                }
            }
        };

        tracing::info!(run_id = %run.run_id, status = %outcome.status, "Run finished");
        self.record(&run.run_id, outcome).await;
    }

    async fn record(&self, run_id: &str, outcome: RunOutcome) {
        let id = run_id.to_string();
        if let Err(e) = with_conn(&self.db, move |conn| run_record::finish(conn, &id, &outcome)).await {
            tracing::error!(run_id = %run_id, "Cannot record run outcome: {e:#}");
        }
    }
}

fn backup_outcome(result: Result<BackupSet, OrchestratorError>) -> RunOutcome {
    match result {
        Ok(set) => {
            let warnings = set.warnings();
            RunOutcome {
                status: set.status.as_str().to_string(),
                set_id: Some(set.id.clone()),
                exit_code: Some(i64::from(set.exit_code())),
                message: (!warnings.is_empty()).then(|| warnings.join("; ")),
            }
        }
        Err(e) => error_outcome(e),
    }
}

fn error_outcome(error: OrchestratorError) -> RunOutcome {
    let status = match error {
        OrchestratorError::LockContention(_) => "skipped",
        OrchestratorError::Cancelled => "cancelled",
        _ => "failed",
    };
    RunOutcome {
        status: status.into(),
        set_id: None,
        exit_code: Some(2),
        message: Some(error.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use backup_orchestrator::adapters::AdapterRegistry;
    use backup_orchestrator::lock::{FileRunLock, RunLock};
    use std::path::Path;
    use std::time::Duration;

    pub fn pool(root: &Path) -> DbPool {
        let pool = create_pool(&root.join("history.db").to_string_lossy()).unwrap();
        migrate(&pool).unwrap();
        pool
    }

    /// An orchestrator with no components under `root`.
    pub fn orchestrator(root: &Path) -> Arc<BackupOrchestrator> {
        let lock: Arc<dyn RunLock> = Arc::new(FileRunLock::new(root.join(".run.lock"), Duration::from_secs(60)));
        Arc::new(BackupOrchestrator::new(root.join("sets"), AdapterRegistry::new(), lock))
    }

    /// Poll until the run leaves `queued`/`running`.
    pub async fn wait_finished(db: &DbPool, id: &str) -> RunRecord {
        for _ in 0..200 {
            let run_id = id.to_string();
            let record = with_conn(db, move |conn| run_record::find_by_id(conn, &run_id))
                .await
                .unwrap()
                .unwrap();
            if record.finished_at.is_some() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} never finished", id);
    }
}
