//! Checksum and format validation of backup sets.
//!
//! Used by recovery before anything is touched, and by `backup verify` to
//! re-check a stored set and downgrade its status if artifacts went bad.

use crate::fs::archive::checksum_file;
use crate::manifest::{load_set_as, write_manifest};
use crate::models::{BackupSet, ComponentBackup, ComponentType, SetStatus};
use crate::utils::errors::{OrchestratorError, Result};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

/// Check one artifact's presence, size and checksum against its record.
pub fn verify_artifact(set: &BackupSet, component: &ComponentBackup) -> Result<()> {
    let path = set.artifact_file(component).ok_or_else(|| {
        OrchestratorError::Integrity(format!("{} has no artifact in set {}", component.component, set.id))
    })?;
    let expected = component.checksum.as_deref().ok_or_else(|| {
        OrchestratorError::Integrity(format!("{} artifact has no recorded checksum", component.component))
    })?;

    let meta = std::fs::metadata(&path).map_err(|e| {
        OrchestratorError::Integrity(format!("{} artifact {} unreadable: {}", component.component, path.display(), e))
    })?;
    if meta.len() != component.size_bytes {
        return Err(OrchestratorError::Integrity(format!(
            "{} artifact size {} does not match recorded {}",
            component.component,
            meta.len(),
            component.size_bytes
        )));
    }

    let actual = checksum_file(&path)?;
    if actual != expected {
        return Err(OrchestratorError::Integrity(format!(
            "{} artifact checksum mismatch (recorded {}, computed {})",
            component.component, expected, actual
        )));
    }
    Ok(())
}

/// Verify the artifacts of `components` in `set`. Every requested component
/// must have an artifact.
pub fn verify_components(set: &BackupSet, components: &[ComponentType]) -> Result<()> {
    for component in components {
        let record = set.component(*component).ok_or_else(|| {
            OrchestratorError::Integrity(format!("component {} is not part of set {}", component, set.id))
        })?;
        verify_artifact(set, record)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentCheck {
    pub component: ComponentType,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub set_id: String,
    pub previous_status: SetStatus,
    pub status: SetStatus,
    pub checks: Vec<ComponentCheck>,
}

impl VerifyReport {
    pub fn all_ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }

    /// 0 all artifacts intact, 1 some non-critical artifact bad, 2 set unusable.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            SetStatus::Failed => 2,
            _ if !self.all_ok() => 1,
            _ => 0,
        }
    }
}

/// Re-verify every artifact of the set in `set_dir` and persist the refined
/// status. A bad artifact is dropped from the record and becomes a warning.
///
/// A corrupt manifest is returned as an error: nothing in it can be trusted
/// enough to rewrite.
pub fn refine_set(set_dir: &Path) -> Result<VerifyReport> {
    let dir_name = set_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut set = load_set_as(set_dir, &dir_name)?;
    let previous_status = set.status;
    let mut checks = Vec::new();
    let mut changed = false;

    for i in 0..set.components.len() {
        let record = set.components[i].clone();
        if record.artifact_path.is_none() {
            checks.push(ComponentCheck {
                component: record.component,
                ok: false,
                detail: record.warning.clone().unwrap_or_else(|| "no artifact".into()),
            });
            continue;
        }

        match verify_artifact(&set, &record) {
            Ok(()) => checks.push(ComponentCheck {
                component: record.component,
                ok: true,
                detail: record.checksum.clone().unwrap_or_default(),
            }),
            Err(OrchestratorError::Integrity(reason)) => {
                warn!(set_id = %set.id, component = %record.component, "Artifact failed verification: {}", reason);
                let entry = &mut set.components[i];
                entry.artifact_path = None;
                entry.checksum = None;
                entry.size_bytes = 0;
                entry.warning = Some(format!("verification failed: {}", reason));
                changed = true;
                checks.push(ComponentCheck {
                    component: record.component,
                    ok: false,
                    detail: reason,
                });
            }
            Err(e) => return Err(e),
        }
    }

    if changed {
        set.recompute_total_size();
        set.status = set.derive_status();
        write_manifest(&set)?;
        info!(
            set_id = %set.id,
            from = %previous_status,
            to = %set.status,
            "Set status refined after verification"
        );
    }

    Ok(VerifyReport {
        set_id: set.id.clone(),
        previous_status,
        status: set.status,
        checks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::FakeAdapter;
    use crate::adapters::{AdapterContext, BackupAdapter};
    use crate::fs::archive::Compression;
    use crate::manifest::{create_set_dir, load_set};
    use chrono::Utc;
    use tempfile::TempDir;

    async fn stored_set(sets_dir: &Path, components: &[ComponentType]) -> BackupSet {
        let (id, dir) = create_set_dir(sets_dir, Utc::now()).unwrap();
        let mut set = BackupSet::new(id, &dir);
        let ctx = AdapterContext::new(&dir, Compression::default());
        for component in components {
            let artifact = FakeAdapter::new(*component, "state").backup(&ctx).await.unwrap();
            set.components.push(ComponentBackup {
                component: *component,
                artifact_path: Some(artifact.file_name()),
                checksum: Some(artifact.checksum),
                size_bytes: artifact.size_bytes,
                created_at: Utc::now(),
                warning: None,
            });
        }
        set.recompute_total_size();
        set.status = set.derive_status();
        write_manifest(&set).unwrap();
        set
    }

    fn corrupt(path: &Path) {
        let mut bytes = std::fs::read(path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(path, bytes).unwrap();
    }

    #[tokio::test]
    async fn test_intact_set_verifies() {
        let tmp = TempDir::new().unwrap();
        let set = stored_set(tmp.path(), &[ComponentType::Database, ComponentType::Logs]).await;
        verify_components(&set, &[ComponentType::Database, ComponentType::Logs]).unwrap();

        let report = refine_set(set.set_dir()).unwrap();
        assert!(report.all_ok());
        assert_eq!(report.status, SetStatus::Success);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_missing_component_is_integrity_error() {
        let tmp = TempDir::new().unwrap();
        let set = stored_set(tmp.path(), &[ComponentType::Database]).await;
        let err = verify_components(&set, &[ComponentType::Cache]).unwrap_err();
        assert!(matches!(err, OrchestratorError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_corrupt_logs_downgrades_to_partial() {
        let tmp = TempDir::new().unwrap();
        let set = stored_set(tmp.path(), &[ComponentType::Database, ComponentType::Logs]).await;
        corrupt(&set.set_dir().join("logs.tar.gz"));

        assert!(verify_artifact(&set, set.component(ComponentType::Logs).unwrap()).is_err());

        let report = refine_set(set.set_dir()).unwrap();
        assert_eq!(report.previous_status, SetStatus::Success);
        assert_eq!(report.status, SetStatus::PartialSuccess);
        assert_eq!(report.exit_code(), 1);

        let reloaded = load_set(set.set_dir()).unwrap();
        assert_eq!(reloaded.status, SetStatus::PartialSuccess);
        assert!(reloaded.component(ComponentType::Logs).unwrap().artifact_path.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_database_fails_set() {
        let tmp = TempDir::new().unwrap();
        let set = stored_set(tmp.path(), &[ComponentType::Database]).await;
        std::fs::remove_file(set.set_dir().join("database.tar.gz")).unwrap();

        let report = refine_set(set.set_dir()).unwrap();
        assert_eq!(report.status, SetStatus::Failed);
        assert_eq!(report.exit_code(), 2);
    }
}
