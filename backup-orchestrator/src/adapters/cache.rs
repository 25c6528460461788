//! Cache adapter. Best-effort: whatever the cache last persisted is what
//! gets backed up, so entries written after the save are lost.

use super::command::run_command;
use super::{run_blocking, AdapterContext, Artifact, BackupAdapter};
use crate::fs::archive::{unpack, ArchiveWriter};
use crate::fs::atomic::remove_leftover;
use crate::models::ComponentType;
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct CacheAdapter {
    data_file: PathBuf,
    save_command: Vec<String>,
}

impl CacheAdapter {
    pub fn new(data_file: PathBuf, save_command: Vec<String>) -> Self {
        Self {
            data_file,
            save_command,
        }
    }

    fn entry_name(&self) -> String {
        self.data_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cache.dat".to_string())
    }
}

#[async_trait]
impl BackupAdapter for CacheAdapter {
    fn component(&self) -> ComponentType {
        ComponentType::Cache
    }

    async fn backup(&self, ctx: &AdapterContext) -> Result<Artifact> {
        if !self.save_command.is_empty() {
            run_command(&self.save_command, None, None).await?;
        }
        if !self.data_file.is_file() {
            return Err(OrchestratorError::NotFound(format!(
                "cache data file {} does not exist",
                self.data_file.display()
            )));
        }

        let src = self.data_file.clone();
        let entry = self.entry_name();
        let dest = ctx.artifact_path(ComponentType::Cache);
        let compression = ctx.compression;
        let packed = run_blocking(move || {
            let mut writer = ArchiveWriter::create(&dest, compression)?;
            writer.append_file(&src, &entry)?;
            writer.finish()
        })
        .await?;

        info!(component = "cache", bytes = packed.size_bytes, "Cache data file archived");
        Ok(Artifact::from_packed(ComponentType::Cache, packed))
    }

    async fn restore(&self, ctx: &AdapterContext, artifact: &Path) -> Result<()> {
        let staging = ctx.staging_dir(ComponentType::Cache);
        remove_leftover(&staging);

        let artifact = artifact.to_path_buf();
        let target = self.data_file.clone();
        let entry = self.entry_name();
        let unpack_to = staging.clone();
        let result = run_blocking(move || {
            unpack(&artifact, &unpack_to)?;
            let restored = unpack_to.join(&entry);
            if !restored.is_file() {
                return Err(OrchestratorError::Integrity(format!(
                    "{} missing from {}",
                    entry,
                    artifact.display()
                )));
            }
            replace_file(&restored, &target)
        })
        .await;

        remove_leftover(&staging);
        if result.is_ok() {
            warn!(
                component = "cache",
                "Cache restored from its last persisted state; later writes are not recoverable"
            );
        }
        result
    }

    async fn discard(&self) -> Result<()> {
        match std::fs::remove_file(&self.data_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> Result<()> {
        if self.data_file.is_file() {
            Ok(())
        } else {
            Err(OrchestratorError::NotFound(format!(
                "cache data file {} missing after restore",
                self.data_file.display()
            )))
        }
    }
}

/// Copy `src` next to `target`, fsync, then rename over `target`.
fn replace_file(src: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".restore-tmp");
    let tmp = target.with_file_name(tmp_name);

    std::fs::copy(src, &tmp)?;
    std::fs::File::open(&tmp)?.sync_all()?;
    std::fs::rename(&tmp, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::archive::Compression;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_with_save_command() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("redis/dump.rdb");
        std::fs::create_dir_all(data.parent().unwrap()).unwrap();

        // The save command is what produces the data file.
        let save = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("printf 'REDIS0009' > {}", data.display()),
        ];
        let adapter = CacheAdapter::new(data.clone(), save);
        let ctx = AdapterContext::new(tmp.path().join("set"), Compression::default());
        std::fs::create_dir_all(&ctx.dest_dir).unwrap();

        let artifact = adapter.backup(&ctx).await.unwrap();
        assert_eq!(artifact.file_name(), "cache.tar.gz");

        std::fs::write(&data, "newer").unwrap();
        adapter.restore(&ctx, &artifact.path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&data).unwrap(), "REDIS0009");
        assert!(!data.with_file_name("dump.rdb.restore-tmp").exists());
        adapter.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_data_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        let adapter = CacheAdapter::new(tmp.path().join("dump.rdb"), Vec::new());
        let ctx = AdapterContext::new(tmp.path(), Compression::default());
        let err = adapter.backup(&ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
        assert!(adapter.health_check().await.is_err());
    }
}
