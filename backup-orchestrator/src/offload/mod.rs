//! Remote offload of backup sets to object storage.
//!
//! Objects are keyed `{prefix}/{setId}/{file}`. Uploads are idempotent (an
//! object whose remote size already matches is skipped) and the manifest goes
//! last, so a remote set with a manifest is always complete.

pub mod fs;
pub mod http;
pub mod progress;

use crate::config::RemoteConfig;
use crate::fs::atomic::remove_leftover;
use crate::manifest::{load_set, set_dir_for, MANIFEST_FILE};
use crate::models::BackupSet;
use crate::retry::RetryPolicy;
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub use self::fs::FsObjectStore;
pub use self::http::HttpObjectStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Minimal object storage contract. Bodies are streamed from and to files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, key: &str, src: &Path) -> Result<()>;

    /// Download `key` into `dest`, returning the number of bytes written.
    async fn get_file(&self, key: &str, dest: &Path) -> Result<u64>;

    /// Size of `key`, or `None` if it does not exist.
    async fn stat(&self, key: &str) -> Result<Option<u64>>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadReport {
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct OffloadClient {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl OffloadClient {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            retry,
            timeout,
        }
    }

    pub fn from_config(config: &RemoteConfig, retry: RetryPolicy, timeout: Duration) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.kind.as_str() {
            "http" => {
                let url = config.url.as_deref().ok_or_else(|| {
                    OrchestratorError::Configuration("remote.url is required".into())
                })?;
                Arc::new(HttpObjectStore::new(url, config.token.clone(), timeout)?)
            }
            "filesystem" => {
                let path = config.path.clone().ok_or_else(|| {
                    OrchestratorError::Configuration("remote.path is required".into())
                })?;
                Arc::new(FsObjectStore::new(path))
            }
            other => {
                return Err(OrchestratorError::Configuration(format!(
                    "unknown remote kind '{}'",
                    other
                )))
            }
        };
        Ok(Self::new(
            store,
            &config.prefix,
            retry.with_max_attempts(config.max_attempts),
            timeout,
        ))
    }

    pub fn key(&self, set_id: &str, file: &str) -> String {
        if self.prefix.is_empty() {
            format!("{}/{}", set_id, file)
        } else {
            format!("{}/{}/{}", self.prefix, set_id, file)
        }
    }

    /// Upload every artifact of `set`, then its manifest.
    pub async fn upload(&self, set: &BackupSet) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        let mut files: Vec<String> = set
            .components
            .iter()
            .filter_map(|c| c.artifact_path.clone())
            .collect();
        files.push(MANIFEST_FILE.to_string());

        for file in files {
            let key = self.key(&set.id, &file);
            let local = set.set_dir().join(&file);
            if self.upload_object(&key, &local).await? {
                report.uploaded.push(key);
            } else {
                report.skipped.push(key);
            }
        }

        info!(
            set_id = %set.id,
            uploaded = report.uploaded.len(),
            skipped = report.skipped.len(),
            "Set offloaded"
        );
        Ok(report)
    }

    /// Returns `false` when the remote copy was already complete.
    async fn upload_object(&self, key: &str, local: &Path) -> Result<bool> {
        let local_size = tokio::fs::metadata(local).await?.len();
        let store = &self.store;

        self.retry
            .run("offload", self.timeout, || async move {
                if store.stat(key).await? == Some(local_size) {
                    debug!(key, "Remote object already complete, skipping");
                    return Ok(false);
                }
                store.put_file(key, local).await?;
                match store.stat(key).await? {
                    Some(remote) if remote == local_size => Ok(true),
                    other => Err(OrchestratorError::TransientIo(format!(
                        "{}: remote size {:?} does not match local size {}",
                        key, other, local_size
                    ))),
                }
            })
            .await
    }

    /// Fetch set `set_id` into `sets_dir/{set_id}` and return it.
    ///
    /// Objects land in a hidden staging directory that is renamed into place
    /// only after every size and the manifest checksum check out.
    pub async fn download(&self, set_id: &str, sets_dir: &Path) -> Result<BackupSet> {
        let dest = set_dir_for(sets_dir, set_id)?;
        let set_prefix = format!("{}/", self.key(set_id, "").trim_end_matches('/'));
        let objects = self
            .retry
            .run("offload", self.timeout, || self.store.list(&set_prefix))
            .await?;

        if !objects.iter().any(|o| o.key.ends_with(&format!("/{}", MANIFEST_FILE))) {
            return Err(OrchestratorError::NotFound(format!(
                "set {} has no manifest in remote storage",
                set_id
            )));
        }

        tokio::fs::create_dir_all(sets_dir).await?;
        let staging: PathBuf = sets_dir.join(format!(".download-{}", set_id));
        remove_leftover(&staging);
        tokio::fs::create_dir_all(&staging).await?;

        let fetched = self.fetch_all(&objects, &set_prefix, &staging).await;
        let staged = fetched.and_then(|_| load_set(&staging)).and_then(|set| {
            if set.id == set_id {
                Ok(())
            } else {
                Err(OrchestratorError::Integrity(format!(
                    "remote manifest under {} describes set {}",
                    set_id, set.id
                )))
            }
        });
        if let Err(e) = staged {
            remove_leftover(&staging);
            return Err(e);
        }

        if dest.exists() {
            remove_leftover(&staging);
            return Err(OrchestratorError::Configuration(format!(
                "set {} already exists locally",
                set_id
            )));
        }
        tokio::fs::rename(&staging, &dest).await?;
        info!(set_id, objects = objects.len(), "Set downloaded from remote storage");
        load_set(&dest)
    }

    async fn fetch_all(&self, objects: &[ObjectInfo], set_prefix: &str, staging: &Path) -> Result<()> {
        for object in objects {
            let name = object.key.strip_prefix(set_prefix).unwrap_or(&object.key);
            if name.is_empty() || name.contains('/') || name.starts_with('.') {
                continue;
            }
            let dest = staging.join(name);
            let written = self
                .retry
                .run("offload", self.timeout, || self.store.get_file(&object.key, &dest))
                .await?;
            if written != object.size {
                return Err(OrchestratorError::Integrity(format!(
                    "{}: downloaded {} bytes, expected {}",
                    object.key, written, object.size
                )));
            }
        }
        Ok(())
    }
}

/// Directory-backed store with injectable put failures.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub struct FlakyStore {
        pub inner: FsObjectStore,
        pub failures_left: AtomicU32,
        pub puts: AtomicU32,
    }

    impl FlakyStore {
        pub fn new(root: PathBuf, failures: u32) -> Self {
            Self {
                inner: FsObjectStore::new(root),
                failures_left: AtomicU32::new(failures),
                puts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put_file(&self, key: &str, src: &Path) -> Result<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(OrchestratorError::TransientIo("connection reset by peer".into()));
            }
            self.inner.put_file(key, src).await
        }

        async fn get_file(&self, key: &str, dest: &Path) -> Result<u64> {
            self.inner.get_file(key, dest).await
        }

        async fn stat(&self, key: &str) -> Result<Option<u64>> {
            self.inner.stat(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
            self.inner.list(prefix).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FlakyStore;
    use super::*;
    use crate::manifest::testing::sample_set;
    use crate::models::SetStatus;
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        }
    }

    fn set_with_artifact(sets_dir: &Path) -> BackupSet {
        let set = sample_set(sets_dir, Utc::now(), SetStatus::Success);
        std::fs::write(set.set_dir().join("config.tar.gz"), b"abc").unwrap();
        set
    }

    #[tokio::test]
    async fn test_upload_is_idempotent_and_manifest_last() {
        let tmp = TempDir::new().unwrap();
        let set = set_with_artifact(&tmp.path().join("sets"));
        let store = Arc::new(FlakyStore::new(tmp.path().join("bucket"), 0));
        let client = OffloadClient::new(store.clone(), "backups", fast_retry(), Duration::from_secs(5));

        let first = client.upload(&set).await.unwrap();
        assert_eq!(
            first.uploaded,
            vec![
                format!("backups/{}/config.tar.gz", set.id),
                format!("backups/{}/manifest.json", set.id)
            ]
        );

        let second = client.upload(&set).await.unwrap();
        assert!(second.uploaded.is_empty());
        assert_eq!(second.skipped.len(), 2);
        assert_eq!(store.puts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_partial_remote_object_is_reuploaded() {
        let tmp = TempDir::new().unwrap();
        let set = set_with_artifact(&tmp.path().join("sets"));
        let bucket = tmp.path().join("bucket");
        let partial = bucket.join(format!("backups/{}/config.tar.gz", set.id));
        std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
        std::fs::write(&partial, b"a").unwrap();

        let store = Arc::new(FlakyStore::new(bucket, 0));
        let client = OffloadClient::new(store, "backups", fast_retry(), Duration::from_secs(5));
        let report = client.upload(&set).await.unwrap();
        assert_eq!(report.uploaded.len(), 2);
        assert_eq!(std::fs::read(&partial).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_transient_put_failures_are_retried_within_budget() {
        let tmp = TempDir::new().unwrap();
        let set = set_with_artifact(&tmp.path().join("sets"));

        let store = Arc::new(FlakyStore::new(tmp.path().join("bucket"), 3));
        let client = OffloadClient::new(store, "backups", fast_retry(), Duration::from_secs(5));
        client.upload(&set).await.unwrap();

        let store = Arc::new(FlakyStore::new(tmp.path().join("bucket2"), 5));
        let client = OffloadClient::new(store.clone(), "backups", fast_retry(), Duration::from_secs(5));
        let err = client.upload(&set).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.puts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_download_restores_a_missing_set() {
        let tmp = TempDir::new().unwrap();
        let sets = tmp.path().join("sets");
        let set = set_with_artifact(&sets);
        let store = Arc::new(FlakyStore::new(tmp.path().join("bucket"), 0));
        let client = OffloadClient::new(store, "backups", fast_retry(), Duration::from_secs(5));
        client.upload(&set).await.unwrap();

        std::fs::remove_dir_all(set.set_dir()).unwrap();
        let fetched = client.download(&set.id, &sets).await.unwrap();
        assert_eq!(fetched.id, set.id);
        assert_eq!(std::fs::read(fetched.set_dir().join("config.tar.gz")).unwrap(), b"abc");
        assert!(!sets.join(format!(".download-{}", set.id)).exists());
    }

    #[tokio::test]
    async fn test_download_of_unknown_set_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FlakyStore::new(tmp.path().join("bucket"), 0));
        let client = OffloadClient::new(store, "backups", fast_retry(), Duration::from_secs(5));
        let err = client.download("20240101-000000-000", &tmp.path().join("sets")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }
}
