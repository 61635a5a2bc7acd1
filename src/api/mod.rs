/// HTTP API Layer
///
/// Thin JSON endpoints over the `Cymphony` facade:
/// - `workflows`: workflow creation, run creation and worker registration
/// - `runs`: run inspection and drive-by curation
/// - `tasks`: assignment, annotation and skip for workers
///
/// "No task right now" and "job closed" are ordinary 200 responses; only
/// real failures map to error statuses.

pub mod runs;
pub mod tasks;
pub mod workflows;

use crate::error::CymphonyError;
use crate::service::Cymphony;
use axum::{http::StatusCode, response::Json, Router};
use serde_json::{json, Value};

/// Shared state of every route
#[derive(Clone)]
pub struct AppState {
    pub cymphony: Cymphony,
}

/// Error half of every handler result.
pub type ApiError = (StatusCode, Json<Value>);

/// Map a library error onto a status code and a `{ "error": ... }` body.
pub fn reject(e: CymphonyError) -> ApiError {
    let status = match &e {
        CymphonyError::NotFound { .. } => StatusCode::NOT_FOUND,
        CymphonyError::Compile(_)
        | CymphonyError::Configuration(_)
        | CymphonyError::InvalidAnnotation { .. } => StatusCode::BAD_REQUEST,
        CymphonyError::InvalidTransition(_) => StatusCode::CONFLICT,
        CymphonyError::Provider(_) | CymphonyError::Notification(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("❌ Request failed: {}", e);
    } else {
        tracing::debug!("request rejected: {}", e);
    }
    (status, Json(json!({ "error": e.to_string() })))
}

/// Every API route, ready for `with_state`.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(workflows::create_workflow_routes())
        .merge(runs::create_run_routes())
        .merge(tasks::create_task_routes())
}
