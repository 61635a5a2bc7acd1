/// Run inspection and drive-by curation endpoints

use crate::api::{reject, ApiError, AppState};
use crate::service::DriveByVote;
use crate::workflow::types::{Job, Run};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct DriveByRequest {
    pub votes: Vec<DriveByVote>,
}

pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/jobs", get(running_jobs))
        .route("/api/runs/{id}/drive-by", post(drive_by))
}

/// GET /api/runs/{id}
async fn get_run(State(state): State<AppState>, Path(run_id): Path<i64>) -> Result<Json<Run>, ApiError> {
    state.cymphony.run_status(run_id).await.map(Json).map_err(reject)
}

/// GET /api/runs/{id}/jobs
/// Returns the run's RUNNING jobs.
async fn running_jobs(State(state): State<AppState>, Path(run_id): Path<i64>) -> Result<Json<Vec<Job>>, ApiError> {
    state.cymphony.running_jobs(run_id).await.map(Json).map_err(reject)
}

/// POST /api/runs/{id}/drive-by
/// Body: { "votes": [{ "external_id", "worker_id", "annotation" }] }
async fn drive_by(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
    Json(payload): Json<DriveByRequest>,
) -> Result<Json<Value>, ApiError> {
    let accepted = state
        .cymphony
        .drive_by_curate(run_id, &payload.votes)
        .await
        .map_err(reject)?;
    Ok(Json(json!({ "accepted": accepted, "received": payload.votes.len() })))
}
