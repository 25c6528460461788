use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use backup_orchestrator::models::BackupSet;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_sets))
}

/// GET /sets - backup sets, newest first
async fn list_sets(State(state): State<Arc<AppState>>) -> Result<Json<Vec<BackupSet>>, AppError> {
    let orchestrator = state.orchestrator.clone();
    let sets = tokio::task::spawn_blocking(move || orchestrator.list())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(sets))
}
