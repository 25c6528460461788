//! Backup adapters, one per store type.
//!
//! An adapter turns the live state of one store into a single compressed,
//! checksummed artifact and can put that artifact back. The orchestrators
//! never look inside artifacts; they only sequence adapters and record what
//! they return.

pub mod cache;
pub mod command;
pub mod database;
pub mod directory;
pub mod search_index;

use crate::config::Config;
use crate::fs::archive::{Compression, PackedArchive};
use crate::models::ComponentType;
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use cache::CacheAdapter;
pub use database::{DatabaseAdapter, DatabaseSource};
pub use directory::DirectoryAdapter;
pub use search_index::SearchIndexAdapter;

/// Where an adapter writes its artifact and how it compresses it.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// Directory receiving the artifact (a set directory or a pre-restore snapshot directory)
    pub dest_dir: PathBuf,
    pub compression: Compression,
    /// Capturing live state before a restore. A store with no live state
    /// reports `NotFound` instead of archiving an empty placeholder.
    pub snapshot: bool,
}

impl AdapterContext {
    pub fn new(dest_dir: impl Into<PathBuf>, compression: Compression) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            compression,
            snapshot: false,
        }
    }

    pub fn for_snapshot(dest_dir: impl Into<PathBuf>, compression: Compression) -> Self {
        Self {
            snapshot: true,
            ..Self::new(dest_dir, compression)
        }
    }

    /// Final artifact path for a component, e.g. `<dest>/database.tar.gz`.
    pub fn artifact_path(&self, component: ComponentType) -> PathBuf {
        self.dest_dir
            .join(self.compression.artifact_name(component.as_str()))
    }

    /// Scratch directory for intermediate files. Callers remove it.
    pub fn staging_dir(&self, component: ComponentType) -> PathBuf {
        self.dest_dir.join(format!(".{}-staging", component))
    }
}

/// The output of one adapter backup.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub component: ComponentType,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
}

impl Artifact {
    pub fn from_packed(component: ComponentType, packed: PackedArchive) -> Self {
        Self {
            component,
            path: packed.path,
            size_bytes: packed.size_bytes,
            checksum: packed.checksum,
        }
    }

    /// File name relative to the directory it was written into.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait BackupAdapter: Send + Sync {
    fn component(&self) -> ComponentType;

    fn name(&self) -> &str {
        self.component().as_str()
    }

    /// Adapters returning the same key never run concurrently.
    fn resource(&self) -> String {
        self.component().as_str().to_string()
    }

    async fn backup(&self, ctx: &AdapterContext) -> Result<Artifact>;

    async fn restore(&self, ctx: &AdapterContext, artifact: &Path) -> Result<()>;

    /// Post-restore check of the live store.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Remove live state a restore created where none existed before.
    async fn discard(&self) -> Result<()> {
        Ok(())
    }
}

/// Run blocking archive or SQLite work off the async runtime.
pub(crate) async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OrchestratorError::TransientIo(format!("blocking task failed: {}", e)))?
}

/// Configured adapters, at most one per component type.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn BackupAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let c = &config.components;
        let mut registry = Self::new();
        let timeout = config.operation_timeout();

        if let Some(db) = &c.database {
            registry.register(Arc::new(DatabaseAdapter::from_config(db)?));
        }
        if let Some(cache) = &c.cache {
            registry.register(Arc::new(CacheAdapter::new(
                cache.data_file.clone(),
                cache.save_command.clone(),
            )));
        }
        if let Some(search) = &c.search_index {
            registry.register(Arc::new(SearchIndexAdapter::from_config(search, timeout)?));
        }
        if let Some(dir) = &c.object_cache {
            registry.register(Arc::new(DirectoryAdapter::from_config(ComponentType::ObjectCache, dir)));
        }
        if let Some(dir) = &c.config {
            registry.register(Arc::new(DirectoryAdapter::from_config(ComponentType::Config, dir)));
        }
        if let Some(dir) = &c.logs {
            registry.register(Arc::new(DirectoryAdapter::from_config(ComponentType::Logs, dir)));
        }

        Ok(registry)
    }

    /// Add an adapter, replacing any earlier one for the same component.
    pub fn register(&mut self, adapter: Arc<dyn BackupAdapter>) {
        self.adapters.retain(|a| a.component() != adapter.component());
        self.adapters.push(adapter);
    }

    pub fn get(&self, component: ComponentType) -> Option<Arc<dyn BackupAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.component() == component)
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BackupAdapter>> {
        self.adapters.iter()
    }

    pub fn components(&self) -> Vec<ComponentType> {
        let mut components: Vec<_> = self.adapters.iter().map(|a| a.component()).collect();
        components.sort_by_key(|c| c.restore_rank());
        components
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
