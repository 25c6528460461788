//! Health check endpoint.

use crate::state::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

/// GET /health - liveness plus the orchestrator's lock holder
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "backup_cron": state.config.backup_cron,
        "prune_cron": state.config.prune_cron,
        "lock_holder": state.orchestrator.lock_holder().map(|h| h.holder),
    }))
}
