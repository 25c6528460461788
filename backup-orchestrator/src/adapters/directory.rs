//! Directory-backed components: object/model cache, configuration and logs.

use super::{run_blocking, AdapterContext, Artifact, BackupAdapter};
use crate::config::DirectoryConfig;
use crate::fs::archive::{pack_directory, unpack};
use crate::fs::atomic::remove_leftover;
use crate::fs::walker::WalkOptions;
use crate::models::ComponentType;
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct DirectoryAdapter {
    component: ComponentType,
    path: PathBuf,
    exclude: Vec<String>,
}

impl DirectoryAdapter {
    pub fn new(component: ComponentType, path: PathBuf, exclude: Vec<String>) -> Self {
        Self {
            component,
            path,
            exclude,
        }
    }

    pub fn from_config(component: ComponentType, config: &DirectoryConfig) -> Self {
        Self::new(component, config.path.clone(), config.exclude.clone())
    }
}

#[async_trait]
impl BackupAdapter for DirectoryAdapter {
    fn component(&self) -> ComponentType {
        self.component
    }

    fn resource(&self) -> String {
        format!("dir:{}", self.path.display())
    }

    async fn backup(&self, ctx: &AdapterContext) -> Result<Artifact> {
        let src = self.path.clone();
        let dest = ctx.artifact_path(self.component);
        let compression = ctx.compression;
        let options = WalkOptions {
            follow_links: false,
            exclude_patterns: self.exclude.clone(),
        };
        let component = self.component;
        if ctx.snapshot && !src.is_dir() {
            return Err(OrchestratorError::NotFound(format!("{} does not exist", src.display())));
        }

        let packed = run_blocking(move || {
            if src.is_dir() {
                pack_directory(&src, &dest, compression, &options)
            } else {
                warn!(
                    component = component.as_str(),
                    "Source directory {} does not exist, archiving it as empty",
                    src.display()
                );
                let empty = dest.with_extension("empty");
                std::fs::create_dir_all(&empty)?;
                let packed = pack_directory(&empty, &dest, compression, &options);
                remove_leftover(&empty);
                packed
            }
        })
        .await?;

        info!(
            component = self.component.as_str(),
            bytes = packed.size_bytes,
            "Directory {} archived",
            self.path.display()
        );
        Ok(Artifact::from_packed(self.component, packed))
    }

    async fn restore(&self, _ctx: &AdapterContext, artifact: &Path) -> Result<()> {
        let artifact = artifact.to_path_buf();
        let target = self.path.clone();
        run_blocking(move || {
            let staging = sibling(&target, "restore")?;
            if let Err(e) = unpack(&artifact, &staging) {
                remove_leftover(&staging);
                return Err(e);
            }
            replace_directory(&staging, &target)
        })
        .await
    }

    async fn discard(&self) -> Result<()> {
        let target = self.path.clone();
        run_blocking(move || match std::fs::remove_dir_all(&target) {
            Ok(()) => {
                info!("Removed {}, which did not exist before the restore", target.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn health_check(&self) -> Result<()> {
        if self.path.is_dir() {
            Ok(())
        } else {
            Err(OrchestratorError::NotFound(format!(
                "{} is not a directory after restore",
                self.path.display()
            )))
        }
    }
}

/// A fresh hidden path next to `target`, e.g. `/etc/.app.restore-<uuid>`.
pub(crate) fn sibling(target: &Path, tag: &str) -> Result<PathBuf> {
    let parent = target.parent().ok_or_else(|| {
        OrchestratorError::Configuration(format!("{} has no parent directory", target.display()))
    })?;
    std::fs::create_dir_all(parent)?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(parent.join(format!(".{}.{}-{}", name, tag, uuid::Uuid::new_v4().simple())))
}

/// Swap `staging` into place at `target`.
///
/// The old tree is renamed aside first so `target` is only ever missing for
/// the instant between two renames on the same filesystem.
pub(crate) fn replace_directory(staging: &Path, target: &Path) -> Result<()> {
    let old = if target.exists() {
        let old = sibling(target, "old")?;
        std::fs::rename(target, &old)?;
        Some(old)
    } else {
        None
    };

    if let Err(e) = std::fs::rename(staging, target) {
        if let Some(old) = &old {
            if let Err(back) = std::fs::rename(old, target) {
                warn!("Cannot move {} back to {}: {}", old.display(), target.display(), back);
            }
        }
        remove_leftover(staging);
        return Err(e.into());
    }

    if let Some(old) = old {
        std::fs::remove_dir_all(&old)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::archive::Compression;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_replaces_tree() {
        let tmp = TempDir::new().unwrap();
        let models = tmp.path().join("models");
        fs::create_dir_all(models.join("llama")).unwrap();
        fs::write(models.join("llama/weights.bin"), vec![1u8; 2048]).unwrap();
        fs::write(models.join("download.tmp"), b"partial").unwrap();

        let adapter = DirectoryAdapter::new(ComponentType::ObjectCache, models.clone(), vec![".tmp".into()]);
        let ctx = AdapterContext::new(tmp.path().join("set"), Compression::default());
        fs::create_dir_all(&ctx.dest_dir).unwrap();
        let artifact = adapter.backup(&ctx).await.unwrap();
        assert_eq!(artifact.file_name(), "object-cache.tar.gz");

        fs::remove_file(models.join("llama/weights.bin")).unwrap();
        fs::write(models.join("stray.bin"), b"new").unwrap();

        adapter.restore(&ctx, &artifact.path).await.unwrap();
        assert_eq!(fs::read(models.join("llama/weights.bin")).unwrap(), vec![1u8; 2048]);
        assert!(!models.join("stray.bin").exists());
        assert!(!models.join("download.tmp").exists());
        adapter.health_check().await.unwrap();

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".models."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_archives_empty() {
        let tmp = TempDir::new().unwrap();
        let logs = tmp.path().join("logs");
        let adapter = DirectoryAdapter::new(ComponentType::Logs, logs.clone(), Vec::new());
        let ctx = AdapterContext::new(tmp.path().join("set"), Compression::default());
        fs::create_dir_all(&ctx.dest_dir).unwrap();

        let artifact = adapter.backup(&ctx).await.unwrap();
        assert!(artifact.size_bytes > 0);
        assert!(adapter.health_check().await.is_err());

        adapter.restore(&ctx, &artifact.path).await.unwrap();
        assert!(logs.is_dir());
        assert_eq!(fs::read_dir(&logs).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_has_no_snapshot_and_discard_removes_it() {
        let tmp = TempDir::new().unwrap();
        let logs = tmp.path().join("logs");
        let adapter = DirectoryAdapter::new(ComponentType::Logs, logs.clone(), Vec::new());
        let snap = AdapterContext::for_snapshot(tmp.path().join("snap"), Compression::default());
        fs::create_dir_all(&snap.dest_dir).unwrap();

        let err = adapter.backup(&snap).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
        assert!(!snap.artifact_path(ComponentType::Logs).exists());

        fs::create_dir_all(logs.join("app")).unwrap();
        fs::write(logs.join("app/out.log"), "restored").unwrap();
        adapter.discard().await.unwrap();
        assert!(!logs.exists());
        adapter.discard().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_artifact_leaves_target_untouched() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        fs::create_dir_all(&conf).unwrap();
        fs::write(conf.join("app.toml"), "port = 80").unwrap();

        let bogus = tmp.path().join("config.tar.gz");
        fs::write(&bogus, [0x1f, 0x8b, 0, 0, 0]).unwrap();

        let adapter = DirectoryAdapter::new(ComponentType::Config, conf.clone(), Vec::new());
        let ctx = AdapterContext::new(tmp.path(), Compression::default());
        assert!(adapter.restore(&ctx, &bogus).await.is_err());
        assert_eq!(fs::read_to_string(conf.join("app.toml")).unwrap(), "port = 80");
    }
}
