//! Object store backed by a mounted directory (NFS, bucket FUSE mount, ...).

use super::{ObjectInfo, ObjectStore};
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(OrchestratorError::Configuration(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_file(&self, key: &str, src: &Path) -> Result<()> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut partial = dest.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        tokio::fs::copy(src, &partial).await?;
        tokio::fs::File::open(&partial).await?.sync_all().await?;
        tokio::fs::rename(&partial, &dest).await?;
        Ok(())
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let src = self.object_path(key)?;
        match tokio::fs::copy(&src, dest).await {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(OrchestratorError::NotFound(format!("object {} does not exist", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, key: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(self.object_path(key)?).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<ObjectInfo>> {
            let mut objects = Vec::new();
            if !root.exists() {
                return Ok(objects);
            }
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.map_err(std::io::Error::from)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) && !key.ends_with(".partial") {
                    objects.push(ObjectInfo {
                        key,
                        size: entry.metadata().map_err(std::io::Error::from)?.len(),
                    });
                }
            }
            Ok(objects)
        })
        .await
        .map_err(|e| OrchestratorError::TransientIo(format!("listing task failed: {}", e)))?
    }
}
