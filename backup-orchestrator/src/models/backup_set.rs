//! Backup Set and Component Backup records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The closed set of store types the orchestrator knows how to back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentType {
    Database,
    Cache,
    SearchIndex,
    ObjectCache,
    Config,
    Logs,
}

impl ComponentType {
    /// Dependency-safe restore order.
    pub const RESTORE_ORDER: [ComponentType; 6] = [
        ComponentType::Config,
        ComponentType::Database,
        ComponentType::Cache,
        ComponentType::SearchIndex,
        ComponentType::ObjectCache,
        ComponentType::Logs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Database => "database",
            ComponentType::Cache => "cache",
            ComponentType::SearchIndex => "search-index",
            ComponentType::ObjectCache => "object-cache",
            ComponentType::Config => "config",
            ComponentType::Logs => "logs",
        }
    }

    /// Position in [`ComponentType::RESTORE_ORDER`].
    pub fn restore_rank(&self) -> usize {
        Self::RESTORE_ORDER
            .iter()
            .position(|c| c == self)
            .unwrap_or(Self::RESTORE_ORDER.len())
    }

    /// The system of record: its failure fails the whole set.
    pub fn is_critical(&self) -> bool {
        matches!(self, ComponentType::Database)
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "database" | "db" => Ok(ComponentType::Database),
            "cache" => Ok(ComponentType::Cache),
            "search-index" | "search" => Ok(ComponentType::SearchIndex),
            "object-cache" => Ok(ComponentType::ObjectCache),
            "config" => Ok(ComponentType::Config),
            "logs" => Ok(ComponentType::Logs),
            other => Err(format!(
                "unknown component '{}' (expected one of: database, cache, search-index, object-cache, config, logs)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetStatus {
    Pending,
    InProgress,
    Success,
    PartialSuccess,
    Failed,
    Pruned,
}

impl SetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetStatus::Pending => "pending",
            SetStatus::InProgress => "in_progress",
            SetStatus::Success => "success",
            SetStatus::PartialSuccess => "partial_success",
            SetStatus::Failed => "failed",
            SetStatus::Pruned => "pruned",
        }
    }

    /// Sets a restore may be taken from.
    pub fn is_restorable(&self) -> bool {
        matches!(self, SetStatus::Success | SetStatus::PartialSuccess)
    }
}

impl fmt::Display for SetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote offload state of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadState {
    #[default]
    Disabled,
    Pending,
    Uploaded,
}

/// One adapter's output within a set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBackup {
    #[serde(rename = "type")]
    pub component: ComponentType,
    /// Relative to the set directory; `None` when the component failed.
    pub artifact_path: Option<String>,
    pub checksum: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub warning: Option<String>,
}

impl ComponentBackup {
    pub fn failed(component: ComponentType, warning: String) -> Self {
        Self {
            component,
            artifact_path: None,
            checksum: None,
            size_bytes: 0,
            created_at: Utc::now(),
            warning: Some(warning),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.artifact_path.is_some() && self.warning.is_none()
    }
}

/// One backup run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSet {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: SetStatus,
    pub total_size_bytes: u64,
    pub components: Vec<ComponentBackup>,
    #[serde(default)]
    pub offload: OffloadState,
    #[serde(default)]
    pub offload_warning: Option<String>,
    /// Location of this set's manifest file; not part of the manifest itself.
    #[serde(skip)]
    pub manifest_path: PathBuf,
}

impl BackupSet {
    pub fn new(id: String, set_dir: &Path) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            status: SetStatus::Pending,
            total_size_bytes: 0,
            components: Vec::new(),
            offload: OffloadState::Disabled,
            offload_warning: None,
            manifest_path: set_dir.join(crate::manifest::MANIFEST_FILE),
        }
    }

    /// Directory holding the manifest and artifacts.
    pub fn set_dir(&self) -> &Path {
        self.manifest_path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn component(&self, component: ComponentType) -> Option<&ComponentBackup> {
        self.components.iter().find(|c| c.component == component)
    }

    /// Absolute path of a component's artifact, if it has one.
    pub fn artifact_file(&self, component: &ComponentBackup) -> Option<PathBuf> {
        component
            .artifact_path
            .as_ref()
            .map(|rel| self.set_dir().join(rel))
    }

    /// Set-level warnings, `"<component>: <reason>"` followed by the offload warning.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings: Vec<String> = self
            .components
            .iter()
            .filter_map(|c| c.warning.as_ref().map(|w| format!("{}: {}", c.component, w)))
            .collect();
        if let Some(w) = &self.offload_warning {
            warnings.push(format!("offload: {}", w));
        }
        warnings
    }

    /// Derive the terminal status from component outcomes.
    pub fn derive_status(&self) -> SetStatus {
        let critical_failed = self
            .components
            .iter()
            .any(|c| c.component.is_critical() && c.warning.is_some());
        if critical_failed {
            SetStatus::Failed
        } else if self.warnings().is_empty() {
            SetStatus::Success
        } else {
            SetStatus::PartialSuccess
        }
    }

    pub fn recompute_total_size(&mut self) {
        self.total_size_bytes = self.components.iter().map(|c| c.size_bytes).sum();
    }

    /// CLI exit code: 0 clean, 1 warnings present, 2 failed.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            SetStatus::Failed => 2,
            _ if !self.warnings().is_empty() => 1,
            SetStatus::PartialSuccess => 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(component: ComponentType) -> ComponentBackup {
        ComponentBackup {
            component,
            artifact_path: Some(format!("{}.tar.gz", component)),
            checksum: Some("sha256:00".into()),
            size_bytes: 10,
            created_at: Utc::now(),
            warning: None,
        }
    }

    #[test]
    fn test_component_names_round_trip() {
        for c in ComponentType::RESTORE_ORDER {
            assert_eq!(c.as_str().parse::<ComponentType>().unwrap(), c);
        }
        assert_eq!("object_cache".parse::<ComponentType>().unwrap(), ComponentType::ObjectCache);
        assert!("queue".parse::<ComponentType>().is_err());
    }

    #[test]
    fn test_restore_order_puts_config_before_database() {
        assert!(ComponentType::Config.restore_rank() < ComponentType::Database.restore_rank());
        assert!(ComponentType::Database.restore_rank() < ComponentType::Cache.restore_rank());
        assert_eq!(ComponentType::Logs.restore_rank(), 5);
    }

    #[test]
    fn test_status_derivation() {
        let mut set = BackupSet::new("s1".into(), Path::new("/tmp/s1"));
        set.components.push(artifact(ComponentType::Database));
        set.components.push(artifact(ComponentType::Cache));
        assert_eq!(set.derive_status(), SetStatus::Success);

        set.components
            .push(ComponentBackup::failed(ComponentType::ObjectCache, "timeout".into()));
        assert_eq!(set.derive_status(), SetStatus::PartialSuccess);
        assert_eq!(set.warnings(), vec!["object-cache: timeout".to_string()]);

        set.components[0] = ComponentBackup::failed(ComponentType::Database, "dump failed".into());
        assert_eq!(set.derive_status(), SetStatus::Failed);
    }

    #[test]
    fn test_exit_codes() {
        let mut set = BackupSet::new("s1".into(), Path::new("/tmp/s1"));
        set.components.push(artifact(ComponentType::Database));
        set.status = set.derive_status();
        assert_eq!(set.exit_code(), 0);

        set.offload_warning = Some("connection refused".into());
        assert_eq!(set.exit_code(), 1);

        set.status = SetStatus::Failed;
        assert_eq!(set.exit_code(), 2);
    }

    #[test]
    fn test_manifest_field_names() {
        let mut set = BackupSet::new("s1".into(), Path::new("/tmp/s1"));
        set.components.push(ComponentBackup::failed(ComponentType::SearchIndex, "timeout".into()));
        let json = serde_json::to_value(&set).unwrap();
        assert!(json.get("totalSizeBytes").is_some());
        assert!(json.get("manifestPath").is_none());
        assert_eq!(json["components"][0]["type"], "search-index");
        assert!(json["components"][0]["artifactPath"].is_null());
    }
}
