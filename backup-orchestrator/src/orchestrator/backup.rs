//! Backup run orchestration.
//!
//! The database is dumped first and alone; if that fails nothing else is
//! worth keeping and the run ends `Failed`. The other adapters then run with
//! bounded parallelism, adapters sharing a resource key staying sequential.

use crate::adapters::{AdapterContext, AdapterRegistry, BackupAdapter};
use crate::config::Config;
use crate::fs::archive::Compression;
use crate::fs::atomic::remove_leftover;
use crate::lock::{FileRunLock, LockInfo, RunLock};
use crate::manifest::retention::{self, PruneReport, RetentionPolicy};
use crate::manifest::{create_set_dir, list_sets, set_dir_for, write_manifest};
use crate::models::{BackupSet, ComponentBackup, ComponentType, OffloadState, SetStatus};
use crate::offload::OffloadClient;
use crate::retry::RetryPolicy;
use crate::utils::errors::{OrchestratorError, Result};
use crate::verifier::{refine_set, VerifyReport};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct BackupOrchestrator {
    sets_dir: PathBuf,
    compression: Compression,
    registry: AdapterRegistry,
    lock: Arc<dyn RunLock>,
    retry: RetryPolicy,
    operation_timeout: Duration,
    parallelism: usize,
    retention: RetentionPolicy,
    offload: Option<Arc<OffloadClient>>,
}

impl BackupOrchestrator {
    pub fn new(sets_dir: impl Into<PathBuf>, registry: AdapterRegistry, lock: Arc<dyn RunLock>) -> Self {
        Self {
            sets_dir: sets_dir.into(),
            compression: Compression::default(),
            registry,
            lock,
            retry: RetryPolicy::default(),
            operation_timeout: Duration::from_secs(900),
            parallelism: 1,
            retention: RetentionPolicy::default(),
            offload: None,
        }
    }

    /// Wire everything from a validated config.
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

        Ok(Self::new(config.sets_dir(), AdapterRegistry::from_config(config)?, lock)
            .with_compression(Compression::from_config(
                &config.storage.compression,
                config.storage.compression_level,
            )?)
            .with_retry(retry, config.operation_timeout())
            .with_parallelism(config.run.parallelism)
            .with_retention(RetentionPolicy::from(&config.retention))
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

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.clamp(1, 3);
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_offload(mut self, offload: Option<Arc<OffloadClient>>) -> Self {
        self.offload = offload;
        self
    }

    pub fn sets_dir(&self) -> &Path {
        &self.sets_dir
    }

    /// Current run lock holder, if any.
    pub fn lock_holder(&self) -> Option<LockInfo> {
        self.lock.holder().ok().flatten()
    }

    /// Run one backup of every configured component.
    ///
    /// Returns the finished set, whatever its status. Errors are reserved for
    /// runs that produced no set: lock contention, cancellation, or failure to
    /// create the set directory.
    pub async fn run_backup(&self, cancel: &CancellationToken) -> Result<BackupSet> {
        let _guard = self.lock.try_acquire("backup")?;
        let started = Instant::now();

        let (id, set_dir) = create_set_dir(&self.sets_dir, Utc::now())?;
        let mut set = BackupSet::new(id, &set_dir);
        set.status = SetStatus::InProgress;
        info!(set_id = %set.id, components = self.registry.len(), "Backup run started");

        let ctx = AdapterContext::new(&set_dir, self.compression);

        if let Some(database) = self.registry.get(ComponentType::Database) {
            self.check_cancelled(cancel, &set_dir)?;
            let outcome = self.run_adapter(database.as_ref(), &ctx).await;
            let failed = outcome.warning.is_some();
            set.components.push(outcome);
            if failed {
                set.recompute_total_size();
                set.status = SetStatus::Failed;
                write_manifest(&set)?;
                error!(set_id = %set.id, "Database backup failed; run aborted");
                return Ok(set);
            }
        }

        let groups = self.resource_groups();
        let group_runs: Vec<_> = groups
            .into_iter()
            .map(|group| self.run_group(group, &ctx, cancel))
            .collect();
        let outcomes: Vec<Vec<ComponentBackup>> = stream::iter(group_runs)
            .buffer_unordered(self.parallelism)
            .collect()
            .await;
        self.check_cancelled(cancel, &set_dir)?;

        set.components.extend(outcomes.into_iter().flatten());
        set.components.sort_by_key(|c| c.component.restore_rank());
        set.recompute_total_size();
        set.status = set.derive_status();
        if self.offload.is_some() {
            set.offload = OffloadState::Pending;
        }
        write_manifest(&set)?;

        info!(
            set_id = %set.id,
            status = %set.status,
            total_bytes = set.total_size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backup set written"
        );
        for warning in set.warnings() {
            warn!(set_id = %set.id, "{}", warning);
        }

        match retention::prune(&self.sets_dir, &self.retention, Utc::now(), false) {
            Ok(report) if !report.deleted.is_empty() => {
                info!(deleted = report.deleted.len(), "Retention pruned old sets")
            }
            Ok(_) => {}
            Err(e) => warn!(kind = e.kind(), "Retention prune failed: {}", e),
        }

        if let Some(offload) = &self.offload {
            if cancel.is_cancelled() {
                warn!(set_id = %set.id, "Cancelled before offload; set stays pending");
            } else {
                self.offload_set(offload, &mut set).await?;
                self.offload_pending(offload, &set.id).await;
            }
        }

        Ok(set)
    }

    /// Delete the set directory of a cancelled run and report the cancellation.
    fn check_cancelled(&self, cancel: &CancellationToken, set_dir: &Path) -> Result<()> {
        if !cancel.is_cancelled() {
            return Ok(());
        }
        warn!(set_dir = %set_dir.display(), "Backup run cancelled; discarding partial set");
        if let Err(e) = std::fs::remove_dir_all(set_dir) {
            warn!("Failed to remove cancelled set {}: {}", set_dir.display(), e);
        }
        Err(OrchestratorError::Cancelled)
    }

    /// Non-database adapters grouped by resource key, in restore order.
    fn resource_groups(&self) -> Vec<Vec<Arc<dyn BackupAdapter>>> {
        let mut adapters: Vec<Arc<dyn BackupAdapter>> = self
            .registry
            .iter()
            .filter(|a| a.component() != ComponentType::Database)
            .cloned()
            .collect();
        adapters.sort_by_key(|a| a.component().restore_rank());

        let mut groups: Vec<(String, Vec<Arc<dyn BackupAdapter>>)> = Vec::new();
        for adapter in adapters {
            let key = adapter.resource();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(adapter),
                None => groups.push((key, vec![adapter])),
            }
        }
        groups.into_iter().map(|(_, group)| group).collect()
    }

    async fn run_group(
        &self,
        group: Vec<Arc<dyn BackupAdapter>>,
        ctx: &AdapterContext,
        cancel: &CancellationToken,
    ) -> Vec<ComponentBackup> {
        let mut outcomes = Vec::with_capacity(group.len());
        for adapter in group {
            if cancel.is_cancelled() {
                break;
            }
            outcomes.push(self.run_adapter(adapter.as_ref(), ctx).await);
        }
        outcomes
    }

    /// Back up one component. Failures become the component's warning.
    async fn run_adapter(&self, adapter: &dyn BackupAdapter, ctx: &AdapterContext) -> ComponentBackup {
        let component = adapter.component();
        let started = Instant::now();
        info!(component = %component, "Component backup started");

        let result = self
            .retry
            .run(adapter.name(), self.operation_timeout, || adapter.backup(ctx))
            .await;

        match result {
            Ok(artifact) => {
                info!(
                    component = %component,
                    bytes = artifact.size_bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Component backup complete"
                );
                ComponentBackup {
                    component,
                    artifact_path: Some(artifact.file_name()),
                    checksum: Some(artifact.checksum),
                    size_bytes: artifact.size_bytes,
                    created_at: Utc::now(),
                    warning: None,
                }
            }
            Err(e) => {
                discard_partial(ctx, component);
                ComponentBackup::failed(component, e.to_string())
            }
        }
    }

    async fn offload_set(&self, offload: &OffloadClient, set: &mut BackupSet) -> Result<()> {
        match offload.upload(set).await {
            Ok(report) => {
                set.offload = OffloadState::Uploaded;
                info!(
                    set_id = %set.id,
                    uploaded = report.uploaded.len(),
                    skipped = report.skipped.len(),
                    "Set offloaded"
                );
            }
            Err(e) => {
                error!(set_id = %set.id, kind = e.kind(), "Offload failed: {}", e);
                set.offload_warning = Some(e.to_string());
                if set.status == SetStatus::Success {
                    set.status = SetStatus::PartialSuccess;
                }
            }
        }
        write_manifest(set)
    }

    /// Retry earlier sets that never made it off the host.
    async fn offload_pending(&self, offload: &OffloadClient, current_id: &str) {
        let sets = match list_sets(&self.sets_dir) {
            Ok(sets) => sets,
            Err(e) => {
                warn!("Cannot list sets for pending offload: {}", e);
                return;
            }
        };
        for mut set in sets
            .into_iter()
            .filter(|s| s.id != current_id && s.offload == OffloadState::Pending)
        {
            match offload.upload(&set).await {
                Ok(_) => {
                    set.offload = OffloadState::Uploaded;
                    set.offload_warning = None;
                    if let Err(e) = write_manifest(&set) {
                        warn!(set_id = %set.id, "Cannot record offload: {}", e);
                    } else {
                        info!(set_id = %set.id, "Pending set offloaded");
                    }
                }
                Err(e) => warn!(set_id = %set.id, "Pending set still not offloaded: {}", e),
            }
        }
    }

    /// Sets newest first.
    pub fn list(&self) -> Result<Vec<BackupSet>> {
        list_sets(&self.sets_dir)
    }

    pub fn prune(&self, dry_run: bool) -> Result<PruneReport> {
        let _guard = self.lock.try_acquire("prune")?;
        retention::prune(&self.sets_dir, &self.retention, Utc::now(), dry_run)
    }

    /// Re-check a stored set's artifacts and persist the refined status.
    pub async fn verify(&self, set_id: &str) -> Result<VerifyReport> {
        let set_dir = set_dir_for(&self.sets_dir, set_id)?;
        let _guard = self.lock.try_acquire("verify")?;
        if !set_dir.is_dir() {
            return Err(OrchestratorError::NotFound(format!("backup set {}", set_id)));
        }
        crate::adapters::run_blocking(move || refine_set(&set_dir)).await
    }
}

/// Remove whatever a failed adapter left behind so the set holds only
/// recorded artifacts.
fn discard_partial(ctx: &AdapterContext, component: ComponentType) {
    let artifact = ctx.artifact_path(component);
    let mut partial = artifact.clone().into_os_string();
    partial.push(".partial");
    for file in [artifact, PathBuf::from(partial)] {
        remove_leftover(&file);
    }
    remove_leftover(&ctx.staging_dir(component));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{Behaviour, FakeAdapter};
    use crate::manifest::load_set;
    use crate::offload::testing::FlakyStore;
    use crate::offload::FsObjectStore;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        }
    }

    fn orchestrator(root: &Path, adapters: Vec<Arc<FakeAdapter>>) -> BackupOrchestrator {
        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }
        let lock: Arc<dyn RunLock> =
            Arc::new(FileRunLock::new(root.join(".run.lock"), Duration::from_secs(60)));
        BackupOrchestrator::new(root.join("sets"), registry, lock)
            .with_retry(fast_retry(), Duration::from_millis(200))
    }

    fn stack() -> Vec<Arc<FakeAdapter>> {
        vec![
            Arc::new(FakeAdapter::new(ComponentType::Database, "rows")),
            Arc::new(FakeAdapter::new(ComponentType::Config, "app.toml")),
            Arc::new(FakeAdapter::new(ComponentType::ObjectCache, "blobs")),
            Arc::new(FakeAdapter::new(ComponentType::Logs, "lines")),
        ]
    }

    #[tokio::test]
    async fn test_clean_run_is_success() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(tmp.path(), stack());

        let set = orch.run_backup(&CancellationToken::new()).await.unwrap();
        assert_eq!(set.status, SetStatus::Success);
        assert_eq!(set.exit_code(), 0);
        assert_eq!(set.components.len(), 4);
        assert_eq!(set.components[0].component, ComponentType::Config);

        let stored = load_set(set.set_dir()).unwrap();
        assert_eq!(stored.id, set.id);
        assert_eq!(stored.total_size_bytes, set.total_size_bytes);
        assert!(!tmp.path().join(".run.lock").exists());
    }

    #[tokio::test]
    async fn test_simultaneous_runs_one_proceeds() {
        let tmp = TempDir::new().unwrap();
        let mut adapters = stack();
        adapters[2] = Arc::new(FakeAdapter::new(ComponentType::ObjectCache, "blobs").with_backup(Behaviour::Hang));
        let orch = orchestrator(tmp.path(), adapters);
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(orch.run_backup(&cancel), orch.run_backup(&cancel));
        let results = [first, second];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(OrchestratorError::LockContention(_))))
                .count(),
            1
        );
        assert_eq!(std::fs::read_dir(tmp.path().join("sets")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_object_cache_timeout_is_partial_success() {
        let tmp = TempDir::new().unwrap();
        let mut adapters = stack();
        adapters[2] = Arc::new(FakeAdapter::new(ComponentType::ObjectCache, "blobs").with_backup(Behaviour::Hang));
        let orch = orchestrator(tmp.path(), adapters).with_parallelism(3);

        let set = orch.run_backup(&CancellationToken::new()).await.unwrap();
        assert_eq!(set.status, SetStatus::PartialSuccess);
        assert_eq!(set.warnings(), vec!["object-cache: timeout".to_string()]);
        assert_eq!(set.exit_code(), 1);
        assert!(!set.set_dir().join("object-cache.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_database_failure_aborts_run() {
        let tmp = TempDir::new().unwrap();
        let adapters = stack();
        *adapters[0].backup_behaviour.lock().unwrap() = Behaviour::Fail;
        let orch = orchestrator(tmp.path(), adapters.clone());

        let set = orch.run_backup(&CancellationToken::new()).await.unwrap();
        assert_eq!(set.status, SetStatus::Failed);
        assert_eq!(set.exit_code(), 2);
        assert_eq!(adapters[1].backups.load(Ordering::SeqCst), 0);
        assert_eq!(load_set(set.set_dir()).unwrap().status, SetStatus::Failed);
    }

    #[tokio::test]
    async fn test_consecutive_runs_have_distinct_ids() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(tmp.path(), stack());

        let first = orch.run_backup(&CancellationToken::new()).await.unwrap();
        let second = orch.run_backup(&CancellationToken::new()).await.unwrap();
        assert_ne!(first.id, second.id);

        let listed = orch.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.status.is_restorable()));
    }

    #[tokio::test]
    async fn test_contended_run_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(tmp.path(), stack());
        let held = FileRunLock::new(tmp.path().join(".run.lock"), Duration::from_secs(60));
        let _guard = held.try_acquire("recover").unwrap();

        let err = orch.run_backup(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LockContention(_)));
        assert!(!tmp.path().join("sets").exists());
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_no_set() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(tmp.path(), stack());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch.run_backup(&cancel).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert!(orch.list().unwrap().is_empty());
        let leftovers = std::fs::read_dir(tmp.path().join("sets")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_shared_resource_keys_run_sequentially() {
        let tmp = TempDir::new().unwrap();
        let mut config = FakeAdapter::new(ComponentType::Config, "a");
        config.resource_key = Some("dir:/srv".into());
        let mut logs = FakeAdapter::new(ComponentType::Logs, "b");
        logs.resource_key = Some("dir:/srv".into());
        let orch = orchestrator(tmp.path(), vec![Arc::new(config), Arc::new(logs)]).with_parallelism(3);

        assert_eq!(orch.resource_groups().len(), 1);
        let set = orch.run_backup(&CancellationToken::new()).await.unwrap();
        assert_eq!(set.status, SetStatus::Success);
    }

    #[tokio::test]
    async fn test_offload_uploads_set() {
        let tmp = TempDir::new().unwrap();
        let bucket = tmp.path().join("bucket");
        let client = OffloadClient::new(Arc::new(FsObjectStore::new(bucket.clone())), "backups", fast_retry(), Duration::from_secs(5));
        let orch = orchestrator(tmp.path(), stack()).with_offload(Some(Arc::new(client)));

        let set = orch.run_backup(&CancellationToken::new()).await.unwrap();
        assert_eq!(set.offload, OffloadState::Uploaded);
        assert_eq!(set.status, SetStatus::Success);
        assert!(bucket.join("backups").join(&set.id).join("manifest.json").exists());
        assert_eq!(load_set(set.set_dir()).unwrap().offload, OffloadState::Uploaded);
    }

    #[tokio::test]
    async fn test_offload_failure_downgrades_then_pending_set_is_retried() {
        let tmp = TempDir::new().unwrap();
        let bucket = tmp.path().join("bucket");
        let store = Arc::new(FlakyStore::new(bucket.clone(), 100));
        let client = OffloadClient::new(store.clone(), "backups", fast_retry(), Duration::from_secs(5));
        let orch = orchestrator(tmp.path(), stack()).with_offload(Some(Arc::new(client)));

        let first = orch.run_backup(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.status, SetStatus::PartialSuccess);
        assert_eq!(first.offload, OffloadState::Pending);
        assert!(first.warnings().iter().any(|w| w.starts_with("offload: ")));
        assert_eq!(first.exit_code(), 1);

        store.failures_left.store(0, Ordering::SeqCst);
        let second = orch.run_backup(&CancellationToken::new()).await.unwrap();
        assert_eq!(second.offload, OffloadState::Uploaded);

        let earlier = load_set(first.set_dir()).unwrap();
        assert_eq!(earlier.offload, OffloadState::Uploaded);
        assert!(bucket.join("backups").join(&first.id).join("manifest.json").exists());
    }
}
