//! Recovery job orchestration.
//!
//! A job validates the whole set before touching anything, snapshots the live
//! state of every target, restores in dependency order and verifies health.
//! Any failure after the first live change rolls the touched components back
//! to their snapshots.

use crate::adapters::{run_blocking, AdapterContext, AdapterRegistry, BackupAdapter};
use crate::config::Config;
use crate::fs::archive::Compression;
use crate::fs::atomic::{remove_leftover, write_json_atomic};
use crate::lock::{FileRunLock, RunLock};
use crate::manifest::{load_set_as, set_dir_for};
use crate::models::{BackupSet, ComponentType, RecoveryJob, RecoveryStatus};
use crate::offload::OffloadClient;
use crate::retry::RetryPolicy;
use crate::supervisor::ServiceGroup;
use crate::utils::errors::{OrchestratorError, Result};
use crate::verifier::verify_components;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Live state captured before a component is restored. `None` means the
/// store had nothing to preserve.
type Snapshots = HashMap<ComponentType, Option<PathBuf>>;

pub struct RecoveryOrchestrator {
    sets_dir: PathBuf,
    recovery_dir: PathBuf,
    compression: Compression,
    registry: AdapterRegistry,
    lock: Arc<dyn RunLock>,
    retry: RetryPolicy,
    operation_timeout: Duration,
    services: ServiceGroup,
    offload: Option<Arc<OffloadClient>>,
}

impl RecoveryOrchestrator {
    pub fn new(
        sets_dir: impl Into<PathBuf>,
        recovery_dir: impl Into<PathBuf>,
        registry: AdapterRegistry,
        lock: Arc<dyn RunLock>,
        services: ServiceGroup,
    ) -> Self {
        Self {
            sets_dir: sets_dir.into(),
            recovery_dir: recovery_dir.into(),
            compression: Compression::default(),
            registry,
            lock,
            retry: RetryPolicy::default(),
            operation_timeout: Duration::from_secs(900),
            services,
            offload: None,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy::from(&config.retry);
        let offload = match &config.remote {
            Some(remote) => Some(Arc::new(OffloadClient::from_config(
                remote,
                retry.clone(),
                config.operation_timeout(),
            )?)),
            None => None,
        };
        let lock: Arc<dyn RunLock> = Arc::new(FileRunLock::new(config.lock_path(), config.lock_ttl()));

        Ok(Self::new(
            config.sets_dir(),
            config.recovery_dir(),
            AdapterRegistry::from_config(config)?,
            lock,
            ServiceGroup::from_config(&config.services),
        )
        .with_compression(Compression::from_config(
            &config.storage.compression,
            config.storage.compression_level,
        )?)
        .with_retry(retry, config.operation_timeout())
        .with_offload(offload))
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy, operation_timeout: Duration) -> Self {
        self.retry = retry;
        self.operation_timeout = operation_timeout;
        self
    }

    pub fn with_offload(mut self, offload: Option<Arc<OffloadClient>>) -> Self {
        self.offload = offload;
        self
    }

    /// Restore `components` (all components with an artifact when `None`)
    /// from set `set_id`.
    ///
    /// The returned job carries the outcome; `Err` is only returned when the
    /// job could not start at all (the run lock is held elsewhere).
    pub async fn restore(
        &self,
        set_id: &str,
        components: Option<Vec<ComponentType>>,
        cancel: &CancellationToken,
    ) -> Result<RecoveryJob> {
        let _guard = self.lock.try_acquire("recover")?;

        let mut job = RecoveryJob::new(set_id, components.clone().unwrap_or_default());
        info!(job_id = %job.id, set_id, "Recovery requested");
        self.persist(&job);

        job.transition(RecoveryStatus::Validating);
        self.persist(&job);
        let set = match self.validate(set_id, components).await {
            Ok(set) => set,
            Err(e) => {
                error!(job_id = %job.id, kind = e.kind(), "Validation failed: {}", e);
                return Ok(self.fail(job, e.to_string()));
            }
        };
        let mut targets: Vec<ComponentType> = set
            .components
            .iter()
            .filter(|c| job.target_components.is_empty() || job.target_components.contains(&c.component))
            .filter(|c| c.artifact_path.is_some())
            .map(|c| c.component)
            .collect();
        targets.sort_by_key(|c| c.restore_rank());
        job.target_components = targets;
        if job.target_components.is_empty() {
            return Ok(self.fail(job, format!("set {} has nothing to restore", set_id)));
        }
        if cancel.is_cancelled() {
            return Ok(self.fail(job, OrchestratorError::Cancelled.to_string()));
        }

        let quiesce = job.target_components.contains(&ComponentType::Database);
        if quiesce {
            if let Err(e) = self.services.stop_all().await {
                job.record_error(format!("quiesce: {}", e));
                self.restart_services(&mut job).await;
                return Ok(self.fail(job, "dependent services could not be stopped"));
            }
        }

        let snapshot_dir = self.recovery_dir.join(&job.id);
        let snapshots = match self.snapshot(&job, &snapshot_dir).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                job.record_error(format!("pre-restore snapshot: {}", e));
                if quiesce {
                    self.restart_services(&mut job).await;
                }
                remove_leftover(&snapshot_dir);
                return Ok(self.fail(job, "nothing was restored"));
            }
        };
        let snapshot_ctx = AdapterContext::new(&snapshot_dir, self.compression);

        job.transition(RecoveryStatus::Restoring);
        self.persist(&job);

        if let Err(e) = self.restore_targets(&mut job, &set, cancel).await {
            return Ok(self.roll_back(job, e, &snapshots, &snapshot_ctx, quiesce).await);
        }

        job.transition(RecoveryStatus::Verifying);
        self.persist(&job);

        if let Err(e) = self.verify_targets(&job).await {
            return Ok(self.roll_back(job, e, &snapshots, &snapshot_ctx, quiesce).await);
        }
        if quiesce {
            if let Err(e) = self.services.start_all().await {
                return Ok(self.roll_back(job, e, &snapshots, &snapshot_ctx, quiesce).await);
            }
        }

        job.transition(RecoveryStatus::Completed);
        self.persist(&job);
        if let Err(e) = std::fs::remove_dir_all(&snapshot_dir) {
            warn!(job_id = %job.id, "Cannot remove pre-restore snapshots: {}", e);
        }
        info!(job_id = %job.id, components = job.target_components.len(), "Recovery completed");
        Ok(job)
    }

    /// Locate the set (downloading it if needed) and check every checksum
    /// before anything is touched.
    async fn validate(&self, set_id: &str, requested: Option<Vec<ComponentType>>) -> Result<BackupSet> {
        let set_dir = set_dir_for(&self.sets_dir, set_id)?;
        if !set_dir.join(crate::manifest::MANIFEST_FILE).exists() {
            match &self.offload {
                Some(offload) => {
                    info!(set_id, "Set not present locally; fetching from remote storage");
                    offload.download(set_id, &self.sets_dir).await?;
                }
                None => return Err(OrchestratorError::NotFound(format!("backup set {}", set_id))),
            }
        }

        let set = {
            let set_dir = set_dir.clone();
            let expected = set_id.to_string();
            run_blocking(move || load_set_as(&set_dir, &expected)).await?
        };
        if !set.status.is_restorable() {
            return Err(OrchestratorError::Integrity(format!(
                "set {} has status {} and cannot be restored",
                set.id, set.status
            )));
        }

        let targets: Vec<ComponentType> = match requested {
            Some(requested) => requested,
            None => set
                .components
                .iter()
                .filter(|c| c.artifact_path.is_some())
                .map(|c| c.component)
                .collect(),
        };
        for component in &targets {
            if self.registry.get(*component).is_none() {
                return Err(OrchestratorError::Configuration(format!(
                    "no adapter configured for {}",
                    component
                )));
            }
        }

        let checked = set.clone();
        run_blocking(move || verify_components(&checked, &targets)).await?;
        Ok(set)
    }

    /// Back up the live state of every target into the job's snapshot directory.
    async fn snapshot(&self, job: &RecoveryJob, snapshot_dir: &Path) -> Result<Snapshots> {
        std::fs::create_dir_all(snapshot_dir)?;
        let ctx = AdapterContext::for_snapshot(snapshot_dir, self.compression);
        let mut snapshots = Snapshots::new();

        for component in &job.target_components {
            let adapter = self.adapter(*component)?;
            let result = self
                .retry
                .run(adapter.name(), self.operation_timeout, || adapter.backup(&ctx))
                .await;
            match result {
                Ok(artifact) => {
                    info!(job_id = %job.id, component = %component, bytes = artifact.size_bytes, "Pre-restore snapshot taken");
                    snapshots.insert(*component, Some(artifact.path));
                }
                Err(OrchestratorError::NotFound(reason)) => {
                    warn!(job_id = %job.id, component = %component, "No live state to preserve: {}", reason);
                    snapshots.insert(*component, None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(snapshots)
    }

    async fn restore_targets(&self, job: &mut RecoveryJob, set: &BackupSet, cancel: &CancellationToken) -> Result<()> {
        let ctx = AdapterContext::new(set.set_dir(), self.compression);
        let mut database_started = false;

        for component in job.target_components.clone() {
            if component == ComponentType::Database {
                database_started = true;
            }
            if !database_started && cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            let adapter = self.adapter(component)?;
            let artifact = set
                .component(component)
                .and_then(|c| set.artifact_file(c))
                .ok_or_else(|| OrchestratorError::Integrity(format!("{} has no artifact", component)))?;

            info!(job_id = %job.id, component = %component, "Restoring component");
            job.touched.push(component);
            self.persist(job);
            self.retry
                .run(adapter.name(), self.operation_timeout, || adapter.restore(&ctx, &artifact))
                .await
                .map_err(|e| prefixed(component, e))?;
        }
        Ok(())
    }

    async fn verify_targets(&self, job: &RecoveryJob) -> Result<()> {
        for component in &job.target_components {
            let adapter = self.adapter(*component)?;
            self.retry
                .run(adapter.name(), self.operation_timeout, || adapter.health_check())
                .await
                .map_err(|e| prefixed(*component, e))?;
            info!(job_id = %job.id, component = %component, "Health check passed");
        }
        Ok(())
    }

    /// Put the touched components back as they were, newest change first.
    async fn roll_back(
        &self,
        mut job: RecoveryJob,
        cause: OrchestratorError,
        snapshots: &Snapshots,
        snapshot_ctx: &AdapterContext,
        quiesce: bool,
    ) -> RecoveryJob {
        job.record_error(cause.to_string());

        // Nothing changed yet: a plain failure, no rollback needed.
        if job.touched.is_empty() {
            if quiesce {
                self.restart_services(&mut job).await;
            }
            return self.fail(job, "nothing was restored");
        }

        warn!(job_id = %job.id, touched = job.touched.len(), "Rolling back: {}", cause);
        for component in job.touched.clone().into_iter().rev() {
            let snapshot = snapshots.get(&component).cloned().flatten();
            let result = match self.adapter(component) {
                Ok(adapter) => match &snapshot {
                    Some(snapshot) => {
                        self.retry
                            .run(adapter.name(), self.operation_timeout, || adapter.restore(snapshot_ctx, snapshot))
                            .await
                    }
                    None => {
                        info!(job_id = %job.id, component = %component, "No pre-restore state; discarding restored data");
                        self.retry
                            .run(adapter.name(), self.operation_timeout, || adapter.discard())
                            .await
                    }
                },
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(
                    job_id = %job.id,
                    component = %component,
                    snapshot = %snapshot.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "none".into()),
                    "FATAL: rollback failed, manual intervention required: {}", e
                );
                return self.fail(job, format!("rollback of {} failed: {}", component, e));
            }
            info!(job_id = %job.id, component = %component, "Component rolled back");
        }

        if quiesce {
            self.restart_services(&mut job).await;
        }
        job.transition(RecoveryStatus::RolledBack);
        self.persist(&job);
        job
    }

    async fn restart_services(&self, job: &mut RecoveryJob) {
        if let Err(e) = self.services.start_all().await {
            error!(job_id = %job.id, "Dependent services did not come back: {}", e);
            job.record_error(format!("restart services: {}", e));
        }
    }

    fn fail(&self, mut job: RecoveryJob, reason: impl Into<String>) -> RecoveryJob {
        job.record_error(reason);
        job.transition(RecoveryStatus::Failed);
        self.persist(&job);
        job
    }

    fn adapter(&self, component: ComponentType) -> Result<Arc<dyn BackupAdapter>> {
        self.registry
            .get(component)
            .ok_or_else(|| OrchestratorError::Configuration(format!("no adapter configured for {}", component)))
    }

    /// Record the job at `recovery/{id}.json`. Losing the record must not
    /// fail the restore itself.
    fn persist(&self, job: &RecoveryJob) {
        let path = self.recovery_dir.join(format!("{}.json", job.id));
        let result = std::fs::create_dir_all(&self.recovery_dir)
            .map_err(OrchestratorError::from)
            .and_then(|_| write_json_atomic(&path, job));
        if let Err(e) = result {
            warn!(job_id = %job.id, "Cannot record recovery job: {}", e);
        }
    }
}

fn prefixed(component: ComponentType, error: OrchestratorError) -> OrchestratorError {
    match error {
        OrchestratorError::Cancelled => OrchestratorError::Cancelled,
        other => OrchestratorError::Service(format!("{}: {}", component, other)),
    }
}

/// Recorded recovery jobs, newest first. Unreadable records are skipped.
pub fn load_jobs(recovery_dir: &Path) -> Result<Vec<RecoveryJob>> {
    let entries = match std::fs::read_dir(recovery_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut jobs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read(&path).map_err(OrchestratorError::from).and_then(|bytes| {
            serde_json::from_slice::<RecoveryJob>(&bytes).map_err(OrchestratorError::from)
        }) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping recovery record {}: {}", path.display(), e),
        }
    }
    jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{Behaviour, FakeAdapter};
    use crate::manifest::{read_manifest, MANIFEST_FILE};
    use crate::orchestrator::BackupOrchestrator;
    use crate::supervisor::testing::FakeSupervisor;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        database: Arc<FakeAdapter>,
        config: Arc<FakeAdapter>,
        logs: Arc<FakeAdapter>,
        supervisor: Arc<FakeSupervisor>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let root = tmp.path().to_path_buf();
            Self {
                _tmp: tmp,
                root,
                database: Arc::new(FakeAdapter::new(ComponentType::Database, "db-v1")),
                config: Arc::new(FakeAdapter::new(ComponentType::Config, "cfg-v1")),
                logs: Arc::new(FakeAdapter::new(ComponentType::Logs, "log-v1")),
                supervisor: Arc::new(FakeSupervisor::with_running(&["api", "worker"])),
            }
        }

        fn registry(&self) -> AdapterRegistry {
            let mut registry = AdapterRegistry::new();
            registry.register(self.database.clone());
            registry.register(self.config.clone());
            registry.register(self.logs.clone());
            registry
        }

        fn lock(&self) -> Arc<dyn RunLock> {
            Arc::new(FileRunLock::new(self.root.join(".run.lock"), Duration::from_secs(60)))
        }

        fn retry() -> RetryPolicy {
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
            }
        }

        async fn backup(&self) -> BackupSet {
            BackupOrchestrator::new(self.root.join("sets"), self.registry(), self.lock())
                .with_retry(Self::retry(), Duration::from_secs(5))
                .run_backup(&CancellationToken::new())
                .await
                .unwrap()
        }

        fn recovery(&self) -> RecoveryOrchestrator {
            let services = ServiceGroup::new(
                self.supervisor.clone(),
                vec!["api".into(), "worker".into()],
                Duration::from_millis(200),
            )
            .with_poll_interval(Duration::from_millis(5));
            RecoveryOrchestrator::new(
                self.root.join("sets"),
                self.root.join("recovery"),
                self.registry(),
                self.lock(),
                services,
            )
            .with_retry(Self::retry(), Duration::from_secs(5))
        }

        fn drift(&self) {
            self.database.set_state("db-v2");
            self.config.set_state("cfg-v2");
            self.logs.set_state("log-v2");
        }
    }

    #[tokio::test]
    async fn test_restore_round_trip_completes() {
        let fx = Fixture::new();
        let set = fx.backup().await;
        fx.drift();

        let job = fx.recovery().restore(&set.id, None, &CancellationToken::new()).await.unwrap();
        assert_eq!(job.status, RecoveryStatus::Completed, "{:?}", job.errors);
        assert_eq!(job.exit_code(), 0);
        assert_eq!(fx.database.state(), "db-v1");
        assert_eq!(fx.config.state(), "cfg-v1");
        assert_eq!(fx.logs.state(), "log-v1");
        assert!(fx.supervisor.is_running("api") && fx.supervisor.is_running("worker"));
        assert!(!fx.root.join("recovery").join(&job.id).exists());

        let recorded = load_jobs(&fx.root.join("recovery")).unwrap();
        assert_eq!(recorded[0].id, job.id);
        assert_eq!(recorded[0].status, RecoveryStatus::Completed);
    }

    #[tokio::test]
    async fn test_tampered_manifest_fails_validation_without_side_effects() {
        let fx = Fixture::new();
        let set = fx.backup().await;
        fx.drift();

        let manifest_path = set.set_dir().join(MANIFEST_FILE);
        let mut manifest = read_manifest(set.set_dir()).unwrap();
        manifest.set.total_size_bytes += 1;
        std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();

        let job = fx.recovery().restore(&set.id, None, &CancellationToken::new()).await.unwrap();
        assert_eq!(job.status, RecoveryStatus::Failed);
        assert_eq!(job.exit_code(), 2);
        assert!(job.touched.is_empty());
        assert!(fx.supervisor.calls().is_empty());
        assert_eq!(fx.database.state(), "db-v2");
    }

    #[tokio::test]
    async fn test_failed_database_health_rolls_back() {
        let fx = Fixture::new();
        let set = fx.backup().await;
        fx.drift();
        fx.database.healthy.store(false, Ordering::SeqCst);

        let job = fx.recovery().restore(&set.id, None, &CancellationToken::new()).await.unwrap();
        assert_eq!(job.status, RecoveryStatus::RolledBack);
        assert_eq!(job.exit_code(), 2);
        assert_eq!(fx.database.state(), "db-v2");
        assert_eq!(fx.config.state(), "cfg-v2");
        assert_eq!(fx.logs.state(), "log-v2");
        assert_eq!(
            fx.supervisor.calls(),
            vec!["stop api", "stop worker", "start worker", "start api"]
        );
        assert!(fx.supervisor.is_running("api"));
    }

    #[tokio::test]
    async fn test_failed_rollback_leaves_services_stopped() {
        let fx = Fixture::new();
        let set = fx.backup().await;
        fx.drift();
        // Logs restore fails after database and config were replaced; the
        // rollback then trips over the same failing restore.
        *fx.logs.restore_behaviour.lock().unwrap() = Behaviour::Fail;

        let job = fx.recovery().restore(&set.id, None, &CancellationToken::new()).await.unwrap();
        assert_eq!(job.status, RecoveryStatus::Failed);
        assert!(job.errors.iter().any(|e| e.contains("rollback of logs failed")));
        assert!(!fx.supervisor.is_running("api"));
        assert!(fx.root.join("recovery").join(&job.id).exists());
    }

    #[tokio::test]
    async fn test_subset_without_database_does_not_quiesce() {
        let fx = Fixture::new();
        let set = fx.backup().await;
        fx.drift();

        let job = fx
            .recovery()
            .restore(&set.id, Some(vec![ComponentType::Logs]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(job.status, RecoveryStatus::Completed);
        assert_eq!(fx.logs.state(), "log-v1");
        assert_eq!(fx.database.state(), "db-v2");
        assert!(fx.supervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_component_is_validation_error() {
        let fx = Fixture::new();
        let set = fx.backup().await;

        let job = fx
            .recovery()
            .restore(&set.id, Some(vec![ComponentType::Cache]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(job.status, RecoveryStatus::Failed);
        assert!(fx.supervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_start_fails_untouched() {
        let fx = Fixture::new();
        let set = fx.backup().await;
        fx.drift();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let job = fx.recovery().restore(&set.id, None, &cancel).await.unwrap();
        assert_eq!(job.status, RecoveryStatus::Failed);
        assert!(job.errors.iter().any(|e| e == "Cancelled"));
        assert!(job.touched.is_empty());
        assert_eq!(fx.config.state(), "cfg-v2");
    }

    #[tokio::test]
    async fn test_missing_set_fails() {
        let fx = Fixture::new();
        let job = fx
            .recovery()
            .restore("20200101-000000-000", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(job.status, RecoveryStatus::Failed);
        assert!(job.errors[0].contains("Not found"));
    }

    #[tokio::test]
    async fn test_set_id_outside_sets_dir_is_rejected() {
        let fx = Fixture::new();
        let set = fx.backup().await;
        fx.drift();
        let escaping = format!("../sets/{}", set.id);

        let job = fx.recovery().restore(&escaping, None, &CancellationToken::new()).await.unwrap();
        assert_eq!(job.status, RecoveryStatus::Failed);
        assert!(job.errors[0].contains("invalid backup set id"), "{:?}", job.errors);
        assert!(job.touched.is_empty());
        assert!(fx.supervisor.calls().is_empty());
        assert_eq!(fx.database.state(), "db-v2");
    }

    #[tokio::test]
    async fn test_unreadable_live_state_aborts_before_restore() {
        let fx = Fixture::new();
        let set = fx.backup().await;
        fx.drift();
        *fx.database.backup_behaviour.lock().unwrap() = Behaviour::Fail;

        let job = fx.recovery().restore(&set.id, None, &CancellationToken::new()).await.unwrap();
        assert_eq!(job.status, RecoveryStatus::Failed);
        assert!(job.errors.iter().any(|e| e.starts_with("pre-restore snapshot")));
        assert!(job.touched.is_empty());
        assert_eq!(fx.database.restores.load(Ordering::SeqCst), 0);
        assert_eq!(fx.database.state(), "db-v2");
        assert!(fx.supervisor.is_running("api") && fx.supervisor.is_running("worker"));
        assert!(!fx.root.join("recovery").join(&job.id).exists());
    }

    #[tokio::test]
    async fn test_rollback_discards_state_that_did_not_exist_before() {
        let fx = Fixture::new();
        let set = fx.backup().await;
        fx.drift();
        fx.logs.set_state("");
        fx.logs.absent.store(true, Ordering::SeqCst);
        fx.database.healthy.store(false, Ordering::SeqCst);

        let job = fx.recovery().restore(&set.id, None, &CancellationToken::new()).await.unwrap();
        assert_eq!(job.status, RecoveryStatus::RolledBack, "{:?}", job.errors);
        assert!(fx.logs.absent.load(Ordering::SeqCst));
        assert_eq!(fx.logs.state(), "");
        assert_eq!(fx.database.state(), "db-v2");
        assert_eq!(fx.config.state(), "cfg-v2");
    }

    #[tokio::test]
    async fn test_contended_lock_starts_no_job() {
        let fx = Fixture::new();
        let set = fx.backup().await;
        let lock = fx.lock();
        let _held = lock.try_acquire("backup").unwrap();

        let err = fx.recovery().restore(&set.id, None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LockContention(_)));
        assert!(load_jobs(&fx.root.join("recovery")).unwrap().is_empty());
    }
}
