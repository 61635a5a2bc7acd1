/// Worker-facing task endpoints
///
/// The worker's group membership is resolved once per request from the
/// `worker_id` in the body.

use crate::api::{reject, ApiError, AppState};
use crate::protocol::AssignOutcome;
use crate::service::Submission;
use axum::{
    extract::{Path, State},
    response::Json,
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct WorkerRequest {
    pub worker_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct AnnotationRequest {
    pub worker_id: i64,
    pub annotation: String,
}

pub fn create_task_routes() -> Router<AppState> {
    Router::new()
        .route("/api/jobs/{id}/assign", post(assign))
        .route("/api/jobs/{id}/tasks/{task}/annotation", post(annotate))
        .route("/api/jobs/{id}/tasks/{task}/skip", post(skip))
}

/// POST /api/jobs/{id}/assign
async fn assign(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
    Json(payload): Json<WorkerRequest>,
) -> Result<Json<AssignOutcome>, ApiError> {
    let worker = state.cymphony.worker_context(payload.worker_id).await.map_err(reject)?;
    state
        .cymphony
        .assign_task(&worker, job_id)
        .await
        .map(Json)
        .map_err(reject)
}

/// POST /api/jobs/{id}/tasks/{task}/annotation
async fn annotate(
    State(state): State<AppState>,
    Path((job_id, task_id)): Path<(i64, i64)>,
    Json(payload): Json<AnnotationRequest>,
) -> Result<Json<Submission>, ApiError> {
    let worker = state.cymphony.worker_context(payload.worker_id).await.map_err(reject)?;
    state
        .cymphony
        .submit_annotation(&worker, job_id, task_id, &payload.annotation)
        .await
        .map(Json)
        .map_err(reject)
}

/// POST /api/jobs/{id}/tasks/{task}/skip
async fn skip(
    State(state): State<AppState>,
    Path((job_id, task_id)): Path<(i64, i64)>,
    Json(payload): Json<WorkerRequest>,
) -> Result<Json<Value>, ApiError> {
    let worker = state.cymphony.worker_context(payload.worker_id).await.map_err(reject)?;
    let skipped = state
        .cymphony
        .skip(&worker, job_id, task_id)
        .await
        .map_err(reject)?;
    Ok(Json(json!({ "skipped": skipped })))
}
