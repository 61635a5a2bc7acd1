/// Workflow Management Layer
///
/// Catalog of workflows, runs, jobs and workers:
/// - Type definitions and lifecycle state machines
/// - SQLite persistence with sqlx
/// - Lock-free cache of compiled run programs using ArcSwap

// Status enums with total transition functions
pub mod state;

// Core type definitions
pub mod types;

// SQLite persistence layer for the catalog
pub mod storage;

// Compiled program cache
pub mod registry;

pub use registry::RunRegistry;
pub use state::{AssignmentStatus, JobKind, JobStatus, RunStatus, RunType, TaskState, WorkerKind};
pub use storage::WorkflowStorage;
pub use types::{Job, NewWorkflow, Run, RunOptions, WorkerContext, Workflow, WorkflowArtifacts};
