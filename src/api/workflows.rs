/// Workflow, run-creation and worker registration endpoints

use crate::api::{reject, ApiError, AppState};
use crate::workflow::state::WorkerKind;
use crate::workflow::types::{NewWorkflow, RunOptions};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: i64,
    #[serde(default = "regular")]
    pub kind: WorkerKind,
}

fn regular() -> WorkerKind {
    WorkerKind::Regular
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow))
        .route("/api/workflows/{id}/runs", post(create_run))
        .route("/api/workers", post(register_worker))
}

/// POST /api/workflows
/// Body: { "project_id", "user_id", "name", "artifacts": { "program", "files" } }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<NewWorkflow>,
) -> Result<Json<CreatedResponse>, ApiError> {
    let id = state.cymphony.create_workflow(&payload).await.map_err(reject)?;
    Ok(Json(CreatedResponse {
        id,
        message: format!("Workflow '{}' created", payload.name),
    }))
}

/// POST /api/workflows/{id}/runs
/// Body: { "name"?, "run_type"?, "notification_url"? }
async fn create_run(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Json(options): Json<RunOptions>,
) -> Result<Json<CreatedResponse>, ApiError> {
    let id = state
        .cymphony
        .create_run(workflow_id, &options)
        .await
        .map_err(reject)?;
    Ok(Json(CreatedResponse {
        id,
        message: format!("Run {} of workflow {} started", id, workflow_id),
    }))
}

/// POST /api/workers
async fn register_worker(
    State(state): State<AppState>,
    Json(payload): Json<RegisterWorkerRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    state
        .cymphony
        .register_worker(payload.worker_id, payload.kind)
        .await
        .map_err(reject)?;
    Ok(Json(CreatedResponse {
        id: payload.worker_id,
        message: format!("Worker {} registered as {}", payload.worker_id, payload.kind),
    }))
}
