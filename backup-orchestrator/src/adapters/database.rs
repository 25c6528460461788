//! Relational database adapter.
//!
//! Two sources are supported: an embedded SQLite file copied with the online
//! backup API (consistent while the database is in use), and an opaque
//! dump/restore command pair for server databases.

use super::command::run_command;
use super::{run_blocking, AdapterContext, Artifact, BackupAdapter};
use crate::config::DatabaseConfig;
use crate::fs::archive::{unpack, ArchiveWriter};
use crate::fs::atomic::remove_leftover;
use crate::models::ComponentType;
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName, OpenFlags};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SQLITE_ENTRY: &str = "database.sqlite3";
const DUMP_ENTRY: &str = "database.dump";

#[derive(Debug, Clone)]
pub enum DatabaseSource {
    Sqlite {
        path: PathBuf,
    },
    Command {
        dump: Vec<String>,
        restore: Vec<String>,
        check: Vec<String>,
    },
}

pub struct DatabaseAdapter {
    source: DatabaseSource,
}

impl DatabaseAdapter {
    pub fn new(source: DatabaseSource) -> Self {
        Self { source }
    }

    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let source = match config.kind.as_str() {
            "sqlite" => DatabaseSource::Sqlite {
                path: config.path.clone().ok_or_else(|| {
                    OrchestratorError::Configuration("components.database.path is required".into())
                })?,
            },
            "command" => DatabaseSource::Command {
                dump: config.dump_command.clone(),
                restore: config.restore_command.clone(),
                check: config.check_command.clone(),
            },
            other => {
                return Err(OrchestratorError::Configuration(format!(
                    "unknown database kind '{}'",
                    other
                )))
            }
        };
        Ok(Self::new(source))
    }
}

#[async_trait]
impl BackupAdapter for DatabaseAdapter {
    fn component(&self) -> ComponentType {
        ComponentType::Database
    }

    async fn backup(&self, ctx: &AdapterContext) -> Result<Artifact> {
        let staging = ctx.staging_dir(ComponentType::Database);
        std::fs::create_dir_all(&staging)?;
        let dest = ctx.artifact_path(ComponentType::Database);
        let compression = ctx.compression;

        let result = match &self.source {
            DatabaseSource::Sqlite { path } => {
                let src = path.clone();
                let staging = staging.clone();
                run_blocking(move || {
                    let copy = staging.join(SQLITE_ENTRY);
                    sqlite_online_backup(&src, &copy)?;
                    let mut writer = ArchiveWriter::create(&dest, compression)?;
                    writer.append_file(&copy, SQLITE_ENTRY)?;
                    writer.finish()
                })
                .await
            }
            DatabaseSource::Command { dump, .. } => {
                let dump_file = staging.join(DUMP_ENTRY);
                match run_command(dump, None, Some(&dump_file)).await {
                    Ok(()) => {
                        run_blocking(move || {
                            let mut writer = ArchiveWriter::create(&dest, compression)?;
                            writer.append_file(&dump_file, DUMP_ENTRY)?;
                            writer.finish()
                        })
                        .await
                    }
                    Err(e) => Err(e),
                }
            }
        };

        remove_leftover(&staging);
        let packed = result?;
        info!(
            component = "database",
            bytes = packed.size_bytes,
            "Database dump archived"
        );
        Ok(Artifact::from_packed(ComponentType::Database, packed))
    }

    async fn restore(&self, ctx: &AdapterContext, artifact: &Path) -> Result<()> {
        let staging = ctx.staging_dir(ComponentType::Database);
        remove_leftover(&staging);

        let result = match &self.source {
            DatabaseSource::Sqlite { path } => {
                let target = path.clone();
                let artifact = artifact.to_path_buf();
                let staging = staging.clone();
                run_blocking(move || {
                    unpack(&artifact, &staging)?;
                    let copy = staging.join(SQLITE_ENTRY);
                    if !copy.exists() {
                        return Err(OrchestratorError::Integrity(format!(
                            "{} missing from {}",
                            SQLITE_ENTRY,
                            artifact.display()
                        )));
                    }
                    sqlite_restore(&copy, &target)
                })
                .await
            }
            DatabaseSource::Command { restore, .. } => {
                let artifact = artifact.to_path_buf();
                let unpack_to = staging.clone();
                run_blocking(move || unpack(&artifact, &unpack_to)).await?;
                let dump_file = staging.join(DUMP_ENTRY);
                if dump_file.exists() {
                    run_command(restore, Some(&dump_file), None).await
                } else {
                    Err(OrchestratorError::Integrity(format!("{} missing from artifact", DUMP_ENTRY)))
                }
            }
        };

        remove_leftover(&staging);
        result
    }

    async fn discard(&self) -> Result<()> {
        // Server databases are owned by their dump/restore commands.
        let DatabaseSource::Sqlite { path } = &self.source else {
            return Ok(());
        };
        let path = path.clone();
        run_blocking(move || {
            for suffix in ["", "-wal", "-shm", "-journal"] {
                let mut file = path.clone().into_os_string();
                file.push(suffix);
                match std::fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            info!(component = "database", "Removed {}", path.display());
            Ok(())
        })
        .await
    }

    async fn health_check(&self) -> Result<()> {
        match &self.source {
            DatabaseSource::Sqlite { path } => {
                let path = path.clone();
                run_blocking(move || sqlite_check(&path)).await
            }
            DatabaseSource::Command { check, .. } => run_command(check, None, None).await,
        }
    }
}

/// Copy a live SQLite database page by page into `dest`.
fn sqlite_online_backup(src: &Path, dest: &Path) -> Result<()> {
    if !src.exists() {
        return Err(OrchestratorError::NotFound(format!("{} does not exist", src.display())));
    }
    let conn = Connection::open_with_flags(src, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)?;
    conn.backup(DatabaseName::Main, dest, None::<fn(Progress)>)?;
    debug!("SQLite online backup of {} complete", src.display());
    Ok(())
}

/// Overwrite the live database at `target` with the pages of `src`.
fn sqlite_restore(src: &Path, target: &Path) -> Result<()> {
    sqlite_check(src).map_err(|e| OrchestratorError::Integrity(format!("dump is not a usable database: {}", e)))?;
    let mut conn = Connection::open(target)?;
    conn.restore(DatabaseName::Main, src, None::<fn(Progress)>)?;
    Ok(())
}

/// Connectivity plus a basic query: integrity check and a catalog read.
fn sqlite_check(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(OrchestratorError::NotFound(format!("{} does not exist", path.display())));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if verdict != "ok" {
        return Err(OrchestratorError::Integrity(format!("quick_check: {}", verdict)));
    }
    let _tables: i64 = conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))?;
    Ok(())
}
