/// Crate-wide error taxonomy
///
/// Structural errors (compile, configuration, provider) abort before any state
/// mutation and surface to the caller. Per-task races are never errors: they are
/// answered with `NoTaskAvailable` / `JobClosed` by the protocols.

use crate::compiler::CompileError;
use crate::provider::ProviderError;
use crate::workflow::state::InvalidTransition;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CymphonyError {
    /// DSL syntax or semantic failure; the run is never created.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Bad or missing operator parameters, or an operation aimed at the wrong kind of job.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// More than one live assignment for the same (task, worker).
    /// Indicates a locking-discipline bug and must never be swallowed.
    #[error("concurrency invariant violated: task {task_id} has {pending} pending assignments for worker {worker_id}")]
    ConcurrencyInvariantViolation {
        task_id: i64,
        worker_id: i64,
        pending: i64,
    },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("invalid annotation '{answer}' for job {job_id}")]
    InvalidAnnotation { job_id: i64, answer: String },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("corrupt stored state: {0}")]
    CorruptState(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CymphonyError {
    /// Conditions that should page someone rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CymphonyError::ConcurrencyInvariantViolation { .. })
    }

    pub(crate) fn not_found(entity: &'static str, id: i64) -> Self {
        CymphonyError::NotFound { entity, id }
    }
}

pub type Result<T> = std::result::Result<T, CymphonyError>;
