use crate::db::with_conn;
use crate::error::AppError;
use crate::models::run_record::{self, RunKind, RunRecord, Trigger};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_runs).post(create_run))
        .route("/{id}", get(get_run))
}

#[derive(Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub kind: RunKind,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunRecord>>, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let runs = with_conn(&state.db, move |conn| run_record::find_recent(conn, limit)).await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunRecord>, AppError> {
    let run = with_conn(&state.db, move |conn| run_record::find_by_id(conn, &id)).await?;
    match run {
        Some(r) => Ok(Json(r)),
        None => Err(AppError::NotFound("Run not found".into())),
    }
}

/// POST /runs - queue a backup or prune; 202 with the queued record
async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<RunRecord>), AppError> {
    let run = state.queue.enqueue(body.kind, Trigger::Api).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}
