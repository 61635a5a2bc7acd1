/// DAG execution engine
///
/// Walks a run's operator schedule from a position. Automatic operators run
/// inline; the first human operator with work gets its job tables, becomes
/// RUNNING and suspends the walk. The walk resumes at the next position once
/// that job closes (see `lifecycle`).

use crate::compiler::{LabelParams, OperatorNode, Program};
use crate::error::{CymphonyError, Result};
use crate::protocol::HumanJob;
use crate::provider::{poller, HitSpec, ProviderAdapter, ProviderError};
use crate::runtime::executor::{Deltas, OperatorExecutor, RunScope};
use crate::store::database::Database;
use crate::store::job_tables;
use crate::store::naming::{JobTables, RunNamespace};
use crate::workflow::state::{JobEvent, JobStatus};
use crate::workflow::storage::WorkflowStorage;
use crate::workflow::types::{Job, Run};
use sqlx::SqliteConnection;
use std::path::PathBuf;
use std::sync::Arc;

/// Outcome of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Every operator ran; the run can complete.
    Explored,
    /// Stopped at a RUNNING human job.
    Suspended { job_id: i64 },
}

pub struct ExecutionEngine {
    db: Database,
    storage: WorkflowStorage,
    executor: OperatorExecutor,
    provider: Option<Arc<dyn ProviderAdapter>>,
    data_dir: PathBuf,
    default_timeout_secs: i64,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("data_dir", &self.data_dir)
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

/// Job-scoped table names for a human job.
pub fn job_tables(run: &Run, job_id: i64, params: &LabelParams) -> JobTables {
    let job = namespace(run).job(job_id);
    if params.provider {
        job.provider()
    } else {
        job.local()
    }
}

pub fn namespace(run: &Run) -> RunNamespace {
    RunNamespace::new(run.user_id, run.project_id, run.workflow_id, run.id)
}

/// Copy a closed job's labels (and votes, when bound) into its run tables and
/// drop its indexes. Idempotent.
pub async fn archive_job(
    conn: &mut SqliteConnection,
    namespace: &RunNamespace,
    tables: &JobTables,
    op: &OperatorNode,
) -> Result<()> {
    if let Some(labeled) = op.outputs.first() {
        let copied = job_tables::archive_labels(conn, tables, &namespace.table(labeled)).await?;
        tracing::debug!("🗃️ Archived {} labeled rows into {}", copied, labeled);
    }
    if let Some(votes) = op.outputs.get(1) {
        let copied = job_tables::archive_votes(conn, tables, &namespace.table(votes)).await?;
        tracing::debug!("🗃️ Archived {} votes into {}", copied, votes);
    }
    job_tables::drop_indexes(conn, tables).await
}

impl ExecutionEngine {
    pub fn new(
        db: Database,
        storage: WorkflowStorage,
        executor: OperatorExecutor,
        provider: Option<Arc<dyn ProviderAdapter>>,
        data_dir: PathBuf,
        default_timeout_secs: i64,
    ) -> Self {
        Self {
            db,
            storage,
            executor,
            provider,
            data_dir,
            default_timeout_secs,
        }
    }

    pub fn provider(&self) -> Option<&Arc<dyn ProviderAdapter>> {
        self.provider.as_ref()
    }

    pub fn scope(&self, run: &Run) -> RunScope {
        RunScope::new(namespace(run), &self.data_dir)
    }

    pub fn timeout_secs(&self, params: &LabelParams) -> i64 {
        params.timeout_secs.unwrap_or(self.default_timeout_secs)
    }

    /// Walk the schedule from `from` until a human job suspends it or the
    /// schedule is exhausted.
    pub async fn walk(&self, run: &Run, program: &Program, from: usize) -> Result<Walk> {
        let scope = self.scope(run);
        tracing::info!("🚀 Walking run {} from position {}/{}", run.id, from, program.schedule.len());

        for position in from..program.schedule.len() {
            let (node_id, op) = program.operator_at(position).ok_or_else(|| {
                CymphonyError::CorruptState(format!("run {} schedule position {} is not an operator", run.id, position))
            })?;
            let job = self.storage.job_for_node(run.id, node_id).await?;

            match job.status {
                JobStatus::Completed => {
                    tracing::debug!("⏭️ Job {} already completed", job.id);
                    continue;
                }
                JobStatus::Aborted => {
                    return Err(CymphonyError::CorruptState(format!(
                        "run {} reached aborted job {}",
                        run.id, job.id
                    )));
                }
                JobStatus::Running if op.operator.is_human() => {
                    return Ok(Walk::Suspended { job_id: job.id });
                }
                JobStatus::Idle | JobStatus::Running => {}
            }

            tracing::info!("📍 Step {}/{}: {} (job {})", position + 1, program.schedule.len(), op.operator, job.id);
            if op.operator.is_human() {
                if self.submit_human(run, &scope, &job, op).await? {
                    return Ok(Walk::Suspended { job_id: job.id });
                }
            } else {
                self.run_automatic(&scope, &job, op).await?;
            }
        }

        tracing::info!("🎉 Run {} fully explored", run.id);
        Ok(Walk::Explored)
    }

    async fn run_automatic(&self, scope: &RunScope, job: &Job, op: &OperatorNode) -> Result<()> {
        let started = std::time::Instant::now();
        if job.status == JobStatus::Idle {
            let mut tx = self.db.lock().await?;
            WorkflowStorage::transition_job(tx.conn(), job.id, JobEvent::Start).await?;
            tx.commit().await?;
        }

        {
            let mut conn = self.db.connection().await?;
            self.executor.execute(&mut conn, scope, op).await?;
        }

        let mut tx = self.db.lock().await?;
        WorkflowStorage::transition_job(tx.conn(), job.id, JobEvent::Complete).await?;
        tx.commit().await?;
        tracing::info!("✅ {} (job {}) completed in {:?}", op.operator, job.id, started.elapsed());
        Ok(())
    }

    /// Create and populate the job tables. Returns true when the job is now
    /// RUNNING; false when its input was empty and it completed inline.
    async fn submit_human(&self, run: &Run, scope: &RunScope, job: &Job, op: &OperatorNode) -> Result<bool> {
        let params = op
            .params
            .label()
            .ok_or_else(|| CymphonyError::Configuration(format!("{} has no label parameters", op.operator)))?;
        let input = op
            .inputs
            .first()
            .map(|var| scope.namespace.table(var))
            .ok_or_else(|| CymphonyError::CorruptState(format!("{} has no input", op.operator)))?;
        let tables = job_tables(run, job.id, params);

        let mut tx = self.db.lock().await?;
        let tasks = if params.provider {
            job_tables::create_provider(tx.conn(), &tables, &input).await?
        } else {
            job_tables::create_local(tx.conn(), &tables, &input).await?
        };

        if tasks == 0 {
            archive_job(tx.conn(), &scope.namespace, &tables, op).await?;
            WorkflowStorage::transition_job(tx.conn(), job.id, JobEvent::Start).await?;
            WorkflowStorage::transition_job(tx.conn(), job.id, JobEvent::Complete).await?;
            tx.commit().await?;
            tracing::info!("⏭️ {} (job {}) has no input rows, completed inline", op.operator, job.id);
            return Ok(false);
        }

        if !params.provider {
            WorkflowStorage::transition_job(tx.conn(), job.id, JobEvent::Start).await?;
            tx.commit().await?;
            tracing::info!("👥 {} (job {}) running with {} tasks", op.operator, job.id, tasks);
            return Ok(true);
        }
        tx.commit().await?;

        let provider = self.provider.as_ref().ok_or(ProviderError::NotConfigured)?;
        let spec = self.hit_spec(scope, job, op, params).await?;
        let human = HumanJob {
            job_id: job.id,
            tables: &tables,
            params,
        };
        poller::publish(&self.db, provider.as_ref(), &human, &spec).await?;

        let mut tx = self.db.lock().await?;
        WorkflowStorage::transition_job(tx.conn(), job.id, JobEvent::Start).await?;
        tx.commit().await?;
        tracing::info!("🌐 {} (job {}) published {} tasks to the provider", op.operator, job.id, tasks);
        Ok(true)
    }

    async fn hit_spec(&self, scope: &RunScope, job: &Job, op: &OperatorNode, params: &LabelParams) -> Result<HitSpec> {
        let instructions = tokio::fs::read_to_string(scope.file(&params.instructions)).await?;
        let layout = match &params.layout {
            Some(file) => Some(tokio::fs::read_to_string(scope.file(file)).await?),
            None => None,
        };
        Ok(HitSpec {
            job_id: job.id,
            title: format!("{}_{}", op.operator, op.statement),
            instructions,
            layout,
            labels: params.labels.clone(),
            assignments_per_hit: params.n,
            reward: params.reward.clone(),
            timeout_secs: self.timeout_secs(params),
        })
    }

    /// Push streamed deltas through the automatic operators after `after`,
    /// stopping at the next human operator. Returns how many operators ran.
    pub async fn scoped_walk(&self, run: &Run, program: &Program, after: usize, mut deltas: Deltas) -> Result<usize> {
        let scope = self.scope(run);
        let mut ran = 0;
        let mut conn = self.db.connection().await?;
        for position in after + 1..program.schedule.len() {
            let Some((_, op)) = program.operator_at(position) else {
                continue;
            };
            if op.operator.is_human() {
                tracing::debug!("⏸️ Scoped walk of run {} halts at {}", run.id, op.operator);
                break;
            }
            if self.executor.execute_scoped(&mut conn, &scope, op, &mut deltas).await? {
                ran += 1;
            }
        }
        Ok(ran)
    }
}
