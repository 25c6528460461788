//! Configuration management for the orchestrator.
//!
//! Loads configuration from a TOML file. Every section has defaults except the
//! component sections, which are opt-in: an absent `[components.<name>]`
//! table means that store is not backed up.

use crate::utils::errors::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub components: ComponentsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding sets, the run lock and recovery records
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// Compression algorithm (gzip, zstd)
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Compression level (1-9 for gzip, 1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Adapters run concurrently after the database (1 = sequential, max 3)
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Per adapter/offload operation timeout
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Run lock time-to-live; refreshed while held
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Set ids that are never pruned
    #[serde(default)]
    pub pinned: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Object store kind (http, filesystem)
    pub kind: String,

    /// Base URL for `http`
    #[serde(default)]
    pub url: Option<String>,

    /// Mounted bucket directory for `filesystem`
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Bearer token for `http`
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_remote_prefix")]
    pub prefix: String,

    #[serde(default = "default_offload_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Supervisor backend (systemd, none)
    #[serde(default = "default_supervisor")]
    pub supervisor: String,

    /// Services that read or write the database and must be stopped to restore it
    #[serde(default)]
    pub dependents: Vec<String>,

    /// How long to wait for a service to report the expected health
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentsConfig {
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub search_index: Option<SearchIndexConfig>,
    #[serde(default)]
    pub object_cache: Option<DirectoryConfig>,
    #[serde(default)]
    pub config: Option<DirectoryConfig>,
    #[serde(default)]
    pub logs: Option<DirectoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Source kind (sqlite, command)
    pub kind: String,

    /// Database file for `sqlite`
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Command whose stdout is a consistent logical dump, e.g. `pg_dump -Fc app`
    #[serde(default)]
    pub dump_command: Vec<String>,

    /// Command that reads a dump on stdin
    #[serde(default)]
    pub restore_command: Vec<String>,

    /// Connectivity + basic query check, must exit 0
    #[serde(default)]
    pub check_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// The cache's persistence file (e.g. an RDB dump)
    pub data_file: PathBuf,

    /// Optional command that flushes the cache to `data_file` first
    #[serde(default)]
    pub save_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchIndexConfig {
    pub url: String,

    /// Snapshot repository name registered with the search engine
    pub repository: String,

    /// Filesystem location of that repository
    pub repository_path: PathBuf,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on waiting for a snapshot to finish
    #[serde(default = "default_snapshot_timeout_secs")]
    pub snapshot_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub path: PathBuf,

    /// File names containing any of these substrings are skipped
    #[serde(default)]
    pub exclude: Vec<String>,
}

// Default values
fn default_backup_root() -> PathBuf {
    PathBuf::from("/var/backups/stack")
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_compression_level() -> i32 {
    6
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_parallelism() -> usize {
    1
}

fn default_operation_timeout_secs() -> u64 {
    900
}

fn default_lock_ttl_secs() -> u64 {
    3600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_max_age_days() -> u32 {
    14
}

fn default_remote_prefix() -> String {
    "backups".to_string()
}

fn default_offload_attempts() -> u32 {
    5
}

fn default_supervisor() -> String {
    "none".to_string()
}

fn default_health_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_snapshot_timeout_secs() -> u64 {
    600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_root: default_backup_root(),
            compression: default_compression(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            operation_timeout_secs: default_operation_timeout_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            pinned: Vec::new(),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            supervisor: default_supervisor(),
            dependents: Vec::new(),
            health_timeout_secs: default_health_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            log: LogConfig::default(),
            run: RunConfig::default(),
            retry: RetryConfig::default(),
            retention: RetentionConfig::default(),
            remote: None,
            services: ServicesConfig::default(),
            components: ComponentsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.run.operation_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.run.lock_ttl_secs)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.storage.backup_root.join(".run.lock")
    }

    pub fn sets_dir(&self) -> PathBuf {
        self.storage.backup_root.join("sets")
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.storage.backup_root.join("recovery")
    }

    /// Reject configurations that cannot run. Called before any lock is taken.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(OrchestratorError::Configuration(msg));

        if !matches!(self.storage.compression.as_str(), "gzip" | "zstd") {
            return bad(format!(
                "storage.compression must be gzip or zstd, got '{}'",
                self.storage.compression
            ));
        }
        if self.run.parallelism == 0 || self.run.parallelism > 3 {
            return bad(format!(
                "run.parallelism must be between 1 and 3, got {}",
                self.run.parallelism
            ));
        }
        if self.run.operation_timeout_secs == 0 || self.run.lock_ttl_secs == 0 {
            return bad("run timeouts must be greater than zero".into());
        }
        if self.retry.max_attempts == 0 {
            return bad("retry.max_attempts must be at least 1".into());
        }
        if !matches!(self.services.supervisor.as_str(), "systemd" | "none") {
            return bad(format!(
                "services.supervisor must be systemd or none, got '{}'",
                self.services.supervisor
            ));
        }

        if let Some(remote) = &self.remote {
            match remote.kind.as_str() {
                "http" => {
                    let url = remote.url.as_deref().unwrap_or("");
                    if !(url.starts_with("http://") || url.starts_with("https://")) {
                        return bad("remote.url must be an http(s) URL".into());
                    }
                }
                "filesystem" => {
                    if remote.path.is_none() {
                        return bad("remote.path is required for the filesystem kind".into());
                    }
                }
                other => return bad(format!("unknown remote.kind '{}'", other)),
            }
            if remote.max_attempts == 0 || remote.max_attempts > 5 {
                return bad("remote.max_attempts must be between 1 and 5".into());
            }
        }

        let c = &self.components;
        if c.database.is_none()
            && c.cache.is_none()
            && c.search_index.is_none()
            && c.object_cache.is_none()
            && c.config.is_none()
            && c.logs.is_none()
        {
            return bad("no components configured".into());
        }

        if let Some(db) = &c.database {
            match db.kind.as_str() {
                "sqlite" => {
                    if db.path.is_none() {
                        return bad("components.database.path is required for sqlite".into());
                    }
                }
                "command" => {
                    if db.dump_command.is_empty()
                        || db.restore_command.is_empty()
                        || db.check_command.is_empty()
                    {
                        return bad(
                            "components.database needs dump_command, restore_command and check_command"
                                .into(),
                        );
                    }
                }
                other => return bad(format!("unknown components.database.kind '{}'", other)),
            }
        }

        if let Some(search) = &c.search_index {
            if !(search.url.starts_with("http://") || search.url.starts_with("https://")) {
                return bad("components.search_index.url must be an http(s) URL".into());
            }
            if search.repository.is_empty() {
                return bad("components.search_index.repository must not be empty".into());
            }
        }

        Ok(())
    }
}
