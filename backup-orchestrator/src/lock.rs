//! Exclusive run lock shared by backup, prune and recovery.
//!
//! The file implementation creates the lock with `O_EXCL`, records who holds
//! it, and keeps it alive with a heartbeat. A lock whose expiry has passed, or
//! whose holder process on this host is gone, is stale and may be taken over.
//!
//! Every read-then-write of the lock file (acquire, takeover, heartbeat,
//! release) runs under an exclusive `flock` on a sibling `.section` file, so
//! two contenders can never both take over the same stale lock.

use crate::fs::atomic::write_json_atomic;
use crate::utils::errors::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// `hostname:pid`
    pub holder: String,
    pub hostname: String,
    pub pid: u32,
    pub operation: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    fn new(operation: &str, ttl: Duration) -> Self {
        let hostname = local_hostname();
        let pid = std::process::id();
        let now = Utc::now();
        Self {
            holder: format!("{}:{}", hostname, pid),
            hostname,
            pid,
            operation: operation.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: now + chrono_ttl(ttl),
        }
    }

    /// Expired, or held by a process on this host that no longer exists.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.expires_at <= now {
            return true;
        }
        self.hostname == local_hostname() && !process_alive(self.pid)
    }
}

/// Advisory lock serializing every mutating operation.
pub trait RunLock: Send + Sync {
    /// Take the lock or fail immediately with [`OrchestratorError::LockContention`].
    fn try_acquire(&self, operation: &str) -> Result<LockGuard>;

    /// Current holder, if any (stale or not).
    fn holder(&self) -> Result<Option<LockInfo>>;
}

/// Held lock. Dropping it stops the heartbeat and releases the lock.
pub struct LockGuard {
    info: LockInfo,
    heartbeat: Option<JoinHandle<()>>,
    release: Option<Box<dyn FnOnce(&LockInfo) + Send + Sync>>,
}

impl LockGuard {
    pub fn new(
        info: LockInfo,
        heartbeat: Option<JoinHandle<()>>,
        release: Box<dyn FnOnce(&LockInfo) + Send + Sync>,
    ) -> Self {
        Self {
            info,
            heartbeat,
            release: Some(release),
        }
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("info", &self.info)
            .field("heartbeat", &self.heartbeat.is_some())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(release) = self.release.take() {
            release(&self.info);
        }
    }
}

/// Lock file at `{backup_root}/.run.lock`.
#[derive(Debug, Clone)]
pub struct FileRunLock {
    path: PathBuf,
    ttl: Duration,
}

impl FileRunLock {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn section_path(&self) -> PathBuf {
        section_path(&self.path)
    }

    fn create_exclusive(&self, info: &LockInfo) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&self.path)?;
        let body = serde_json::to_vec_pretty(info)?;
        file.write_all(&body)?;
        file.sync_all()
    }

    /// Whether an existing lock file may be taken over.
    fn existing_is_stale(&self, existing: Option<&LockInfo>) -> bool {
        match existing {
            Some(info) => info.is_stale(Utc::now()),
            // Unparseable: a writer crashed mid-write, or one is writing right now.
            None => std::fs::metadata(&self.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .map(|age| age > self.ttl)
                .unwrap_or(false),
        }
    }

    fn spawn_heartbeat(&self, info: &LockInfo, released: Arc<AtomicBool>) -> Option<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let path = self.path.clone();
        let section = self.section_path();
        let ttl = self.ttl;
        let token = info.token.clone();
        let period = (ttl / 3).max(Duration::from_millis(10));

        Some(handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let _section = match lock_section(&section) {
                    Ok(held) => held,
                    Err(e) => {
                        warn!("Cannot enter run lock section for refresh: {}", e);
                        continue;
                    }
                };
                // Release already ran; writing now would resurrect the lock.
                if released.load(Ordering::SeqCst) {
                    return;
                }
                match read_lock(&path) {
                    Ok(Some(mut current)) if current.token == token => {
                        current.expires_at = Utc::now() + chrono_ttl(ttl);
                        if let Err(e) = write_json_atomic(&path, &current) {
                            warn!("Failed to refresh run lock: {}", e);
                        } else {
                            debug!("Run lock refreshed until {}", current.expires_at);
                        }
                    }
                    _ => {
                        error!("Run lock at {} was lost; another run may be active", path.display());
                        return;
                    }
                }
            }
        }))
    }

    fn guard(&self, info: LockInfo) -> LockGuard {
        let released = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_heartbeat(&info, released.clone());
        let path = self.path.clone();
        LockGuard::new(
            info,
            heartbeat,
            Box::new(move |held: &LockInfo| release_file(&path, held, &released)),
        )
    }
}

impl RunLock for FileRunLock {
    fn try_acquire(&self, operation: &str) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let info = LockInfo::new(operation, self.ttl);
        let _section = lock_section(&self.section_path())?;

        match self.create_exclusive(&info) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = read_lock(&self.path).ok().flatten();
                if !self.existing_is_stale(existing.as_ref()) {
                    let detail = match existing {
                        Some(held) => format!(
                            "held by {} ({}) since {}",
                            held.holder, held.operation, held.acquired_at
                        ),
                        None => "lock file is unreadable and not yet expired".to_string(),
                    };
                    return Err(OrchestratorError::LockContention(detail));
                }
                warn!(
                    holder = existing.as_ref().map(|h| h.holder.as_str()).unwrap_or("unknown"),
                    "Taking over stale run lock"
                );
                match std::fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.create_exclusive(&info)?;
            }
            Err(e) => return Err(e.into()),
        }

        info!(operation, holder = %info.holder, "Run lock acquired");
        Ok(self.guard(info))
    }

    fn holder(&self) -> Result<Option<LockInfo>> {
        read_lock(&self.path)
    }
}

fn section_path(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_owned();
    name.push(".section");
    PathBuf::from(name)
}

/// Block until this open file description holds the exclusive section lock.
/// Held until the returned value is dropped.
fn lock_section(path: &Path) -> std::io::Result<Flock<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| std::io::Error::from(errno))
}

fn read_lock(path: &Path) -> Result<Option<LockInfo>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove the lock file, but only if it is still ours.
fn release_file(path: &Path, held: &LockInfo, released: &AtomicBool) {
    let _section = match lock_section(&section_path(path)) {
        Ok(section) => Some(section),
        Err(e) => {
            warn!("Cannot enter run lock section for release: {}", e);
            None
        }
    };
    released.store(true, Ordering::SeqCst);
    match read_lock(path) {
        Ok(Some(current)) if current.token == held.token => {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to release run lock: {}", e);
            } else {
                info!(operation = %held.operation, "Run lock released");
            }
        }
        Ok(_) => warn!("Run lock was taken over before release; leaving it in place"),
        Err(e) => warn!("Cannot read run lock on release: {}", e),
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1))
}
