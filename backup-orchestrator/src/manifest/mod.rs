//! Manifest files and the on-disk catalogue of backup sets.
//!
//! Each set lives in `sets/{id}/` with exactly one `manifest.json`. The
//! manifest embeds a checksum of itself so a truncated or hand-edited file is
//! rejected before any restore touches live data.

pub mod retention;

use crate::fs::archive::checksum_bytes;
use crate::fs::atomic::write_atomic;
use crate::models::{BackupSet, SetStatus};
use crate::utils::errors::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Prefix of set directories that are being deleted.
pub const TOMBSTONE_PREFIX: &str = ".pruning-";

/// `manifest.json` as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    #[serde(flatten)]
    pub set: BackupSet,
    #[serde(default)]
    pub manifest_checksum: String,
}

impl Manifest {
    /// Wrap a set and compute its self-checksum.
    pub fn seal(set: &BackupSet) -> Result<Self> {
        let mut manifest = Manifest {
            version: MANIFEST_VERSION,
            set: set.clone(),
            manifest_checksum: String::new(),
        };
        manifest.manifest_checksum = manifest.compute_checksum()?;
        Ok(manifest)
    }

    /// SHA-256 of this manifest serialized with an empty checksum field.
    pub fn compute_checksum(&self) -> Result<String> {
        let unsealed = Manifest {
            version: self.version,
            set: self.set.clone(),
            manifest_checksum: String::new(),
        };
        Ok(checksum_bytes(&serde_json::to_vec(&unsealed)?))
    }

    pub fn verify_checksum(&self) -> Result<()> {
        let actual = self.compute_checksum()?;
        if actual != self.manifest_checksum {
            return Err(OrchestratorError::Integrity(format!(
                "manifest checksum mismatch for set {} (recorded {}, computed {})",
                self.set.id, self.manifest_checksum, actual
            )));
        }
        Ok(())
    }
}

/// Atomically write the manifest of `set` to `set.manifest_path`.
pub fn write_manifest(set: &BackupSet) -> Result<()> {
    let manifest = Manifest::seal(set)?;
    let bytes = serde_json::to_vec_pretty(&manifest)?;
    write_atomic(&set.manifest_path, &bytes)
}

/// Read the manifest in `set_dir` without checking its self-checksum.
pub fn read_manifest(set_dir: &Path) -> Result<Manifest> {
    let path = set_dir.join(MANIFEST_FILE);
    let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => OrchestratorError::NotFound(format!("no manifest at {}", path.display())),
        _ => OrchestratorError::Io(e),
    })?;
    let mut manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| {
        OrchestratorError::Integrity(format!("unreadable manifest {}: {}", path.display(), e))
    })?;
    if manifest.version != MANIFEST_VERSION {
        return Err(OrchestratorError::Integrity(format!(
            "unsupported manifest version {} in {}",
            manifest.version,
            path.display()
        )));
    }
    manifest.set.manifest_path = path;
    Ok(manifest)
}

/// Read and checksum-verify a manifest, returning the set it describes.
pub fn load_set(set_dir: &Path) -> Result<BackupSet> {
    let manifest = read_manifest(set_dir)?;
    manifest.verify_checksum()?;
    Ok(manifest.set)
}

/// [`load_set`], additionally requiring the manifest to describe `expected_id`.
pub fn load_set_as(set_dir: &Path, expected_id: &str) -> Result<BackupSet> {
    let set = load_set(set_dir)?;
    if set.id != expected_id {
        return Err(OrchestratorError::Integrity(format!(
            "manifest in {} describes set {}, not {}",
            set_dir.display(),
            set.id,
            expected_id
        )));
    }
    Ok(set)
}

/// Directory of set `id` under `sets_dir`.
///
/// Ids come from the command line and remote listings, so anything other
/// than one plain, non-hidden path segment is rejected.
pub fn set_dir_for(sets_dir: &Path, id: &str) -> Result<PathBuf> {
    let mut components = Path::new(id).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single || id.starts_with('.') || id.contains(['/', '\\']) {
        return Err(OrchestratorError::Configuration(format!("invalid backup set id {:?}", id)));
    }
    Ok(sets_dir.join(id))
}

/// What a scan of the sets directory found.
#[derive(Debug, Default)]
pub struct SetScan {
    /// Newest first
    pub sets: Vec<BackupSet>,
    /// Directories without a manifest (crashed or cancelled runs)
    pub orphans: Vec<PathBuf>,
    /// Half-deleted sets left behind by an interrupted prune
    pub tombstones: Vec<PathBuf>,
    /// Manifests that exist but cannot be read or verified
    pub unreadable: Vec<(PathBuf, String)>,
}

pub fn scan_sets(sets_dir: &Path) -> Result<SetScan> {
    let mut scan = SetScan::default();
    let entries = match std::fs::read_dir(sets_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(scan),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        if name.starts_with(TOMBSTONE_PREFIX) {
            scan.tombstones.push(path);
            continue;
        }
        if name.starts_with('.') {
            continue;
        }
        if !path.join(MANIFEST_FILE).exists() {
            scan.orphans.push(path);
            continue;
        }

        match load_set(&path) {
            Ok(set) if set.status == SetStatus::Pruned => {}
            Ok(set) => scan.sets.push(set),
            Err(e) => {
                warn!("Skipping set {}: {}", name, e);
                scan.unreadable.push((path, e.to_string()));
            }
        }
    }

    scan.sets
        .sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    Ok(scan)
}

/// Readable sets, newest first.
pub fn list_sets(sets_dir: &Path) -> Result<Vec<BackupSet>> {
    Ok(scan_sets(sets_dir)?.sets)
}

/// Create a fresh set directory named after `now`.
///
/// Ids look like `20240314-031500-123`; if that directory already exists a
/// `-N` suffix is appended, so two runs never share a directory.
pub fn create_set_dir(sets_dir: &Path, now: DateTime<Utc>) -> Result<(String, PathBuf)> {
    std::fs::create_dir_all(sets_dir)?;
    let base = now.format("%Y%m%d-%H%M%S-%3f").to_string();

    for n in 0..1000u32 {
        let id = if n == 0 { base.clone() } else { format!("{}-{}", base, n) };
        let dir = sets_dir.join(&id);
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok((id, dir)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(OrchestratorError::TransientIo(format!(
        "could not allocate a set directory for {}",
        base
    )))
}
