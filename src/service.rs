/// `Cymphony`: the boundary every caller goes through
///
/// Opens the store, owns the run controller and the abandonment monitor, and
/// exposes the worker-facing operations. Worker identity is resolved by the
/// caller into a `WorkerContext` once per request and passed explicitly.

use crate::config::Config;
use crate::error::{CymphonyError, Result};
use crate::protocol::{self, assignment, aggregation, AssignOutcome, HumanJob, TaskSnapshot, VoteOutcome};
use crate::provider::{HttpProvider, ProviderAdapter};
use crate::runtime::engine::job_tables;
use crate::runtime::lifecycle::label_params;
use crate::runtime::{AbandonmentMonitor, RunController};
use crate::store::database::Database;
use crate::store::naming::JobTables;
use crate::workflow::state::{JobStatus, WorkerKind};
use crate::workflow::storage::WorkflowStorage;
use crate::workflow::types::{now_millis, Job, NewWorkflow, Run, RunOptions, WorkerContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Result of submitting an annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    /// False when the assignment was no longer pending and the vote was dropped.
    pub recorded: bool,
    /// Label committed by this vote, if any.
    pub finalized: Option<String>,
    /// The caller's next task.
    pub next: AssignOutcome,
}

/// One out-of-band vote for drive-by curation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveByVote {
    /// Task id of the running job's input row.
    pub external_id: i64,
    pub worker_id: i64,
    pub annotation: String,
}

#[derive(Debug, Clone)]
pub struct Cymphony {
    config: Config,
    db: Database,
    storage: WorkflowStorage,
    controller: Arc<RunController>,
    monitor: Arc<AbandonmentMonitor>,
}

/// A running local human job with everything the protocols need.
struct LocalJob {
    job: Job,
    run: Run,
    tables: JobTables,
}

impl LocalJob {
    fn human(&self) -> Result<HumanJob<'_>> {
        Ok(HumanJob {
            job_id: self.job.id,
            tables: &self.tables,
            params: label_params(&self.job)?,
        })
    }
}

impl Cymphony {
    /// Open with the provider adapter named by `config.provider.url`, if any.
    pub async fn open(config: Config) -> Result<Self> {
        let provider = match &config.provider.url {
            Some(url) => {
                let adapter = HttpProvider::new(url.clone(), Duration::from_secs(config.provider.timeout_secs))?;
                Some(Arc::new(adapter) as Arc<dyn ProviderAdapter>)
            }
            None => None,
        };
        Self::open_with_provider(config, provider).await
    }

    pub async fn open_with_provider(config: Config, provider: Option<Arc<dyn ProviderAdapter>>) -> Result<Self> {
        let db = Database::open(&config.database).await?;
        let storage = WorkflowStorage::new(db.pool().clone());
        let controller = RunController::new(config.clone(), db.clone(), provider)?;
        let monitor = Arc::new(AbandonmentMonitor::new(db.clone(), storage.clone()));
        tracing::info!("🎼 Cymphony ready in {}", config.data_dir().display());
        Ok(Self {
            config,
            db,
            storage,
            controller,
            monitor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn storage(&self) -> &WorkflowStorage {
        &self.storage
    }

    pub fn controller(&self) -> &Arc<RunController> {
        &self.controller
    }

    pub fn monitor(&self) -> &Arc<AbandonmentMonitor> {
        &self.monitor
    }

    pub async fn create_workflow(&self, new: &NewWorkflow) -> Result<i64> {
        let id = self.storage.create_workflow(new).await?;
        tracing::info!("📝 Created workflow {} ({})", id, new.name);
        Ok(id)
    }

    /// Compile, persist and start a run. Returns the run id.
    pub async fn create_run(&self, workflow_id: i64, options: &RunOptions) -> Result<i64> {
        Ok(self.controller.create_run(workflow_id, options).await?.id)
    }

    pub async fn register_worker(&self, worker_id: i64, kind: WorkerKind) -> Result<()> {
        self.storage.upsert_worker(worker_id, kind).await
    }

    pub async fn worker_context(&self, worker_id: i64) -> Result<WorkerContext> {
        self.storage.worker_context(worker_id).await
    }

    pub async fn assign_task(&self, worker: &WorkerContext, job_id: i64) -> Result<AssignOutcome> {
        let Some(local) = self.local_job(job_id).await? else {
            return Ok(AssignOutcome::JobClosed);
        };
        let human = local.human()?;
        let timeout = self.controller.engine().timeout_secs(human.params);
        let outcome = assignment::assign(&self.db, &human, worker, timeout, now_millis()).await?;
        if outcome == AssignOutcome::JobClosed {
            self.complete_if_closed(&local).await;
        }
        Ok(outcome)
    }

    /// Record a vote on the caller's pending assignment and hand out the next
    /// task. A vote that closes the job completes it (through the `JobClosed`
    /// of the next assignment), except in pipelined runs where the streaming
    /// loop completes it after its final tick.
    pub async fn submit_annotation(
        &self,
        worker: &WorkerContext,
        job_id: i64,
        task_id: i64,
        answer: &str,
    ) -> Result<Submission> {
        let Some(local) = self.local_job(job_id).await? else {
            return Ok(Submission {
                recorded: false,
                finalized: None,
                next: AssignOutcome::JobClosed,
            });
        };
        let human = local.human()?;
        let outcome = aggregation::submit(&self.db, &human, worker, task_id, answer, now_millis()).await?;
        let (recorded, finalized) = match outcome {
            VoteOutcome::Dropped => (false, None),
            VoteOutcome::Recorded { finalized } => (true, finalized),
        };
        let next = self.assign_task(worker, job_id).await?;
        Ok(Submission {
            recorded,
            finalized,
            next,
        })
    }

    /// Give back a pending assignment. Returns false if there was none.
    pub async fn skip(&self, worker: &WorkerContext, job_id: i64, task_id: i64) -> Result<bool> {
        let Some(local) = self.local_job(job_id).await? else {
            return Ok(false);
        };
        assignment::skip(&self.db, &local.human()?, worker, task_id).await
    }

    pub async fn run_status(&self, run_id: i64) -> Result<Run> {
        self.storage.require_run(run_id).await
    }

    pub async fn running_jobs(&self, run_id: i64) -> Result<Vec<Job>> {
        self.storage.require_run(run_id).await?;
        self.storage.running_jobs(run_id).await
    }

    /// Feed out-of-band votes into the run's running local human job. Votes
    /// for unknown tasks or with labels outside the job's set are skipped.
    /// Returns how many were accepted.
    pub async fn drive_by_curate(&self, run_id: i64, votes: &[DriveByVote]) -> Result<usize> {
        let running: Vec<Job> = self
            .running_jobs(run_id)
            .await?
            .into_iter()
            .filter(Job::is_local_human)
            .collect();
        let job = match running.as_slice() {
            [job] => job,
            [] => {
                return Err(CymphonyError::Configuration(format!(
                    "run {} has no running human job",
                    run_id
                )))
            }
            _ => {
                return Err(CymphonyError::CorruptState(format!(
                    "run {} has {} running human jobs",
                    run_id,
                    running.len()
                )))
            }
        };
        let Some(local) = self.local_job(job.id).await? else {
            return Ok(0);
        };
        let human = local.human()?;

        let mut accepted = 0;
        let mut finalized_any = false;
        for vote in votes {
            let recorded = async {
                let worker = self.storage.worker_context(vote.worker_id).await?;
                aggregation::record_drive_by(&self.db, &human, &worker, vote.external_id, &vote.annotation, now_millis())
                    .await
            };
            match recorded.await {
                Ok(VoteOutcome::Recorded { finalized }) => {
                    accepted += 1;
                    finalized_any |= finalized.is_some();
                }
                Ok(VoteOutcome::Dropped) => {}
                Err(CymphonyError::InvalidAnnotation { answer, .. }) => {
                    tracing::warn!(job_id = job.id, external_id = vote.external_id, "drive-by label '{}' rejected", answer);
                }
                Err(e) => {
                    if finalized_any {
                        self.complete_if_closed(&local).await;
                    }
                    return Err(e);
                }
            }
        }
        tracing::info!(job_id = job.id, "🚗 Drive-by curation accepted {}/{} votes", accepted, votes.len());
        if finalized_any {
            self.complete_if_closed(&local).await;
        }
        Ok(accepted)
    }

    pub async fn final_labels(&self, job_id: i64) -> Result<Vec<(i64, String)>> {
        let (_, _, tables) = self.human_job_parts(job_id).await?;
        let mut conn = self.db.connection().await?;
        protocol::final_labels(&mut conn, &tables).await
    }

    pub async fn task_snapshot(&self, job_id: i64, task_id: i64) -> Result<Option<TaskSnapshot>> {
        let (job, _, tables) = self.human_job_parts(job_id).await?;
        let human = HumanJob {
            job_id,
            tables: &tables,
            params: label_params(&job)?,
        };
        let mut conn = self.db.connection().await?;
        protocol::task_snapshot(&mut conn, &human, task_id).await
    }

    /// Monitor sweep as of `now` (epoch millis).
    pub async fn sweep_at(&self, now: i64) -> Result<usize> {
        self.monitor.sweep_at(now).await
    }

    async fn human_job_parts(&self, job_id: i64) -> Result<(Job, Run, JobTables)> {
        let job = self.storage.require_job(job_id).await?;
        let run = self.storage.require_run(job.run_id).await?;
        let tables = job_tables(&run, job.id, label_params(&job)?);
        Ok((job, run, tables))
    }

    /// Resolve a local human job for the worker protocols. `None` once the job
    /// has completed.
    async fn local_job(&self, job_id: i64) -> Result<Option<LocalJob>> {
        let (job, run, tables) = self.human_job_parts(job_id).await?;
        if job.is_provider_human() {
            return Err(CymphonyError::Configuration(format!(
                "job {} is served by the provider",
                job_id
            )));
        }
        match job.status {
            JobStatus::Running => Ok(Some(LocalJob { job, run, tables })),
            JobStatus::Completed => Ok(None),
            status => Err(CymphonyError::Configuration(format!(
                "job {} is {}, not running",
                job_id, status
            ))),
        }
    }

    /// Complete the job if it is closed. Votes are already committed, so a
    /// failure here (a downstream operator aborting the run, say) is logged
    /// and never reaches the worker.
    async fn complete_if_closed(&self, local: &LocalJob) {
        if local.run.run_type.is_pipelined() {
            return;
        }
        if let Err(e) = self.controller.complete_job(local.job.id).await {
            tracing::error!(job_id = local.job.id, run_id = local.run.id, "❌ Completing closed job failed: {}", e);
        }
    }
}
