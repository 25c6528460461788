//! Search index adapter driving the engine's snapshot REST API.
//!
//! The engine writes snapshots into a filesystem repository it has
//! registered; this adapter triggers one, waits for it, and archives the
//! repository together with the name of the snapshot it belongs to.

use super::directory::{replace_directory, sibling};
use super::{run_blocking, AdapterContext, Artifact, BackupAdapter};
use crate::config::SearchIndexConfig;
use crate::fs::archive::{unpack, ArchiveWriter};
use crate::fs::atomic::remove_leftover;
use crate::fs::walker::WalkOptions;
use crate::models::ComponentType;
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const MARKER_ENTRY: &str = "snapshot.json";
const REPOSITORY_ENTRY: &str = "repository";

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMarker {
    repository: String,
    snapshot: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotList {
    snapshots: Vec<SnapshotInfo>,
}

#[derive(Debug, Deserialize)]
struct SnapshotInfo {
    snapshot: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct ClusterHealth {
    status: String,
}

pub struct SearchIndexAdapter {
    client: reqwest::Client,
    base_url: String,
    repository: String,
    repository_path: PathBuf,
    poll_interval: Duration,
    snapshot_timeout: Duration,
}

impl SearchIndexAdapter {
    pub fn from_config(config: &SearchIndexConfig, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            repository: config.repository.clone(),
            repository_path: config.repository_path.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            snapshot_timeout: Duration::from_secs(config.snapshot_timeout_secs),
        })
    }

    fn snapshot_url(&self, snapshot: &str) -> String {
        format!("{}/_snapshot/{}/{}", self.base_url, self.repository, snapshot)
    }

    async fn wait_for_snapshot(&self, snapshot: &str) -> Result<()> {
        let deadline = Instant::now() + self.snapshot_timeout;
        loop {
            let list: SnapshotList = self
                .client
                .get(self.snapshot_url(snapshot))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let state = list
                .snapshots
                .iter()
                .find(|s| s.snapshot == snapshot)
                .map(|s| s.state.as_str())
                .unwrap_or("MISSING");

            match state {
                "SUCCESS" => return Ok(()),
                "IN_PROGRESS" | "STARTED" | "INIT" => {
                    debug!(component = "search-index", snapshot, "Snapshot still in progress");
                }
                other => {
                    return Err(OrchestratorError::TransientIo(format!(
                        "snapshot {} ended in state {}",
                        snapshot, other
                    )))
                }
            }

            if Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout(self.snapshot_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl BackupAdapter for SearchIndexAdapter {
    fn component(&self) -> ComponentType {
        ComponentType::SearchIndex
    }

    async fn backup(&self, ctx: &AdapterContext) -> Result<Artifact> {
        let snapshot = format!("snap-{}", Utc::now().format("%Y%m%d-%H%M%S-%3f"));

        self.client
            .put(format!("{}?wait_for_completion=false", self.snapshot_url(&snapshot)))
            .json(&serde_json::json!({ "indices": "*", "include_global_state": false }))
            .send()
            .await?
            .error_for_status()?;
        info!(component = "search-index", snapshot = %snapshot, "Snapshot started");

        self.wait_for_snapshot(&snapshot).await?;

        if !self.repository_path.is_dir() {
            return Err(OrchestratorError::NotFound(format!(
                "snapshot repository {} is not reachable from this host",
                self.repository_path.display()
            )));
        }

        let marker = serde_json::to_vec_pretty(&SnapshotMarker {
            repository: self.repository.clone(),
            snapshot: snapshot.clone(),
        })?;
        let repo_path = self.repository_path.clone();
        let dest = ctx.artifact_path(ComponentType::SearchIndex);
        let compression = ctx.compression;
        let packed = run_blocking(move || {
            let mut writer = ArchiveWriter::create(&dest, compression)?;
            writer.append_directory(&repo_path, REPOSITORY_ENTRY, &WalkOptions::default())?;
            writer.append_bytes(MARKER_ENTRY, &marker)?;
            writer.finish()
        })
        .await?;

        info!(
            component = "search-index",
            snapshot = %snapshot,
            bytes = packed.size_bytes,
            "Snapshot repository archived"
        );
        Ok(Artifact::from_packed(ComponentType::SearchIndex, packed))
    }

    async fn restore(&self, _ctx: &AdapterContext, artifact: &Path) -> Result<()> {
        let artifact = artifact.to_path_buf();
        let target = self.repository_path.clone();
        // Unpacked next to the repository so the final swap is a same-filesystem rename.
        let marker: SnapshotMarker = run_blocking(move || {
            let staging = sibling(&target, "restore")?;
            let swapped = (|| -> Result<SnapshotMarker> {
                unpack(&artifact, &staging)?;
                let marker: SnapshotMarker =
                    serde_json::from_slice(&std::fs::read(staging.join(MARKER_ENTRY))?)?;
                let repository = staging.join(REPOSITORY_ENTRY);
                std::fs::create_dir_all(&repository)?;
                replace_directory(&repository, &target)?;
                Ok(marker)
            })();
            remove_leftover(&staging);
            swapped
        })
        .await?;

        self.client
            .post(format!("{}/_all/_close", self.base_url))
            .send()
            .await?
            .error_for_status()?;

        self.client
            .post(format!(
                "{}/_snapshot/{}/{}/_restore?wait_for_completion=true",
                self.base_url, marker.repository, marker.snapshot
            ))
            .json(&serde_json::json!({ "indices": "*", "include_global_state": false }))
            .send()
            .await?
            .error_for_status()?;

        info!(component = "search-index", snapshot = %marker.snapshot, "Snapshot restored");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let health: ClusterHealth = self
            .client
            .get(format!("{}/_cluster/health", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if health.status == "red" {
            return Err(OrchestratorError::Service("search cluster health is red".into()));
        }
        Ok(())
    }
}
