/// Core domain types: workflows, runs, jobs and worker context
///
/// Workflows carry their DSL program and uploaded files as one JSON artifact
/// snapshot. Runs and jobs are catalog rows whose only mutation is a status
/// transition.

use crate::compiler::{Operator, OperatorParams, Uploads};
use crate::workflow::state::{JobKind, JobStatus, RunStatus, RunType, WorkerKind};
use serde::{Deserialize, Serialize};

/// DSL source plus the files it references (data CSVs, instruction and layout HTML).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowArtifacts {
    pub program: String,
    #[serde(default)]
    pub files: Uploads,
}

/// Request to create a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub project_id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub artifacts: WorkflowArtifacts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: String,
    pub artifacts: WorkflowArtifacts,
    pub created_at: i64,
}

/// Options supplied when starting a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_run_type")]
    pub run_type: RunType,
    /// Receives one POST when the run completes.
    #[serde(default)]
    pub notification_url: Option<String>,
}

fn default_run_type() -> RunType {
    RunType::Human
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            name: None,
            run_type: default_run_type(),
            notification_url: None,
        }
    }
}

/// One execution of a compiled workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub workflow_id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub name: String,
    pub status: RunStatus,
    pub run_type: RunType,
    pub notification_url: Option<String>,
    /// Epoch milliseconds
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// One operator instance inside a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub run_id: i64,
    pub workflow_id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub node_id: usize,
    pub operator: Operator,
    pub kind: JobKind,
    pub status: JobStatus,
    pub params: OperatorParams,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl Job {
    /// Human job served by the in-house assignment protocol.
    pub fn is_local_human(&self) -> bool {
        matches!(&self.params, OperatorParams::Label(p) if !p.provider)
    }

    pub fn is_provider_human(&self) -> bool {
        matches!(&self.params, OperatorParams::Label(p) if p.provider)
    }
}

/// Worker identity and group membership, resolved once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerContext {
    pub worker_id: i64,
    pub kind: WorkerKind,
}

impl WorkerContext {
    pub fn regular(worker_id: i64) -> Self {
        Self {
            worker_id,
            kind: WorkerKind::Regular,
        }
    }

    pub fn steward(worker_id: i64) -> Self {
        Self {
            worker_id,
            kind: WorkerKind::Steward,
        }
    }

    pub fn is_steward(&self) -> bool {
        self.kind == WorkerKind::Steward
    }
}

/// Current epoch time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
