/// Run and job lifecycle: creation, completion, continuation and abort
///
/// `RunController` owns the engine, the compiled-program cache and the job
/// supervisor. Job completion is lock-and-check on the job row, so however
/// many callers observe a closed job (the last vote, a drive-by batch, a
/// polling loop) its archival and the run's continuation happen once.
///
/// Background loops never complete a job themselves: they post the job id to
/// a completion channel drained by one driver task.

use crate::compiler::{compile, OperatorNode, Program};
use crate::config::Config;
use crate::error::{CymphonyError, Result};
use crate::notify::{Notifier, RunNotification};
use crate::protocol::HumanJob;
use crate::provider::{poller, ProviderAdapter, ProviderError};
use crate::runtime::engine::{archive_job, job_tables, namespace, ExecutionEngine, Walk};
use crate::runtime::executor::OperatorExecutor;
use crate::runtime::supervisor::{JobSupervisor, LoopControl};
use crate::store::database::Database;
use crate::store::job_tables as tables;
use crate::workflow::registry::RunRegistry;
use crate::workflow::state::{JobEvent, JobStatus, RunEvent, RunStatus};
use crate::workflow::storage::WorkflowStorage;
use crate::workflow::types::{Job, Run, RunOptions};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct RunController {
    config: Config,
    db: Database,
    storage: WorkflowStorage,
    registry: RunRegistry,
    engine: ExecutionEngine,
    supervisor: JobSupervisor,
    notifier: Notifier,
    completions: mpsc::UnboundedSender<i64>,
}

impl RunController {
    /// Build the controller and spawn its completion driver. Must be called
    /// inside a tokio runtime.
    pub fn new(config: Config, db: Database, provider: Option<Arc<dyn ProviderAdapter>>) -> Result<Arc<Self>> {
        let storage = WorkflowStorage::new(db.pool().clone());
        let engine = ExecutionEngine::new(
            db.clone(),
            storage.clone(),
            OperatorExecutor::new(config.protocol.materialize_outputs),
            provider,
            config.data_dir().to_path_buf(),
            config.protocol.default_timeout_secs,
        );
        let notifier = Notifier::new(Duration::from_secs(config.notification.timeout_secs))?;
        let (completions, mut requests) = mpsc::unbounded_channel::<i64>();

        let controller = Arc::new(Self {
            registry: RunRegistry::new(storage.clone()),
            config,
            db,
            storage,
            engine,
            supervisor: JobSupervisor::new(),
            notifier,
            completions,
        });

        let weak = Arc::downgrade(&controller);
        tokio::spawn(async move {
            while let Some(job_id) = requests.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = controller.complete_job(job_id).await {
                    tracing::error!(job_id, "❌ Job completion failed: {}", e);
                }
            }
        });

        Ok(controller)
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

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &JobSupervisor {
        &self.supervisor
    }

    /// Compile the workflow, persist the run with its graph and jobs, start it
    /// and walk until the first human job. A compile error creates nothing.
    pub async fn create_run(self: &Arc<Self>, workflow_id: i64, options: &RunOptions) -> Result<Run> {
        let workflow = self
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| CymphonyError::not_found("workflow", workflow_id))?;
        for name in workflow.artifacts.files.keys() {
            if !is_plain_file_name(name) {
                return Err(CymphonyError::Configuration(format!("invalid upload name '{}'", name)));
            }
        }
        let program = compile(
            &workflow.artifacts.program,
            &workflow.artifacts.files,
            &self.config.limits(),
        )?;

        let mut tx = self.db.lock().await?;
        let mut run = self
            .storage
            .insert_run(tx.conn(), &workflow, options, &program)
            .await?;
        run.status = WorkflowStorage::transition_run(tx.conn(), run.id, RunEvent::Start).await?;
        tx.commit().await?;
        tracing::info!("🏁 Created run {} ({}) of workflow {}", run.id, run.run_type, workflow_id);

        let scope = self.engine.scope(&run);
        let snapshot = async {
            tokio::fs::create_dir_all(scope.run_dir.join("files")).await?;
            for (name, contents) in &workflow.artifacts.files {
                tokio::fs::write(scope.file(name), contents).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        if let Err(e) = snapshot.await {
            let e = CymphonyError::from(e);
            self.abort_run(run.id, &e.to_string()).await?;
            return Err(e);
        }

        let program = Arc::new(program);
        self.registry.insert(run.id, Arc::clone(&program));
        self.continue_run(&run, &program, 0).await?;
        self.storage.require_run(run.id).await
    }

    /// Walk from `from` and act on where it stops. A failing walk aborts the run.
    async fn continue_run(self: &Arc<Self>, run: &Run, program: &Program, from: usize) -> Result<Walk> {
        match self.engine.walk(run, program, from).await {
            Ok(Walk::Explored) => {
                self.finish_run(run.id).await?;
                Ok(Walk::Explored)
            }
            Ok(Walk::Suspended { job_id }) => {
                self.start_background(run, job_id).await?;
                Ok(Walk::Suspended { job_id })
            }
            Err(e) => {
                tracing::error!("❌ Run {} failed: {}", run.id, e);
                self.abort_run(run.id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Supervised loops for a RUNNING human job: provider polling for
    /// `label_amt`, streaming for local jobs of pipelined runs.
    async fn start_background(self: &Arc<Self>, run: &Run, job_id: i64) -> Result<()> {
        if self.supervisor.active(job_id) > 0 {
            return Ok(());
        }
        let job = self.storage.require_job(job_id).await?;

        if job.is_provider_human() {
            let controller = Arc::clone(self);
            self.supervisor.spawn(
                job_id,
                run.id,
                "provider poll",
                self.config.provider_poll_interval(),
                move || {
                    let controller = Arc::clone(&controller);
                    async move {
                        if controller.poll_provider(job_id).await? {
                            controller.request_completion(job_id);
                            Ok(LoopControl::Stop)
                        } else {
                            Ok(LoopControl::Continue)
                        }
                    }
                },
            );
        } else if run.run_type.is_pipelined() {
            let controller = Arc::clone(self);
            self.supervisor.spawn(
                job_id,
                run.id,
                "pipeline",
                self.config.pipeline_interval(),
                move || {
                    let controller = Arc::clone(&controller);
                    async move {
                        let tick = controller.stream_once(job_id).await?;
                        if tick.closed {
                            controller.request_completion(job_id);
                            Ok(LoopControl::Stop)
                        } else {
                            Ok(LoopControl::Continue)
                        }
                    }
                },
            );
        }
        Ok(())
    }

    /// Queue a job for completion by the driver task.
    pub fn request_completion(&self, job_id: i64) {
        if self.completions.send(job_id).is_err() {
            tracing::warn!(job_id, "completion driver is gone");
        }
    }

    /// Poll the provider once for a `label_amt` job. Returns true once every
    /// task has a final label.
    pub async fn poll_provider(&self, job_id: i64) -> Result<bool> {
        let job = self.storage.require_job(job_id).await?;
        let run = self.storage.require_run(job.run_id).await?;
        let params = label_params(&job)?;
        let tables = job_tables(&run, job.id, params);
        let provider = self.engine.provider().ok_or(ProviderError::NotConfigured)?;
        let human = HumanJob {
            job_id,
            tables: &tables,
            params,
        };
        let summary = poller::poll_once(&self.db, provider.as_ref(), &human).await?;
        if summary.new_votes > 0 {
            tracing::debug!(job_id, new_votes = summary.new_votes, finalized = summary.finalized, "provider poll");
        }
        let mut conn = self.db.connection().await?;
        tables::is_closed(&mut conn, &tables).await
    }

    /// Complete a closed job: archive, drop indexes, mark COMPLETED, cancel
    /// its loops and continue the run. Returns false when there was nothing
    /// to do (already completed, not closed yet, or not running).
    pub async fn complete_job(self: &Arc<Self>, job_id: i64) -> Result<bool> {
        let job = self.storage.require_job(job_id).await?;
        let run = self.storage.require_run(job.run_id).await?;
        let program = self.registry.program(run.id).await?;
        let (position, op) = operator_of(&program, &job)?;
        let params = label_params(&job)?;
        let tables = job_tables(&run, job.id, params);

        let mut tx = self.db.lock().await?;
        let current = WorkflowStorage::job_locked(tx.conn(), job_id).await?;
        if current.status != JobStatus::Running {
            tx.rollback().await?;
            tracing::debug!(job_id, status = %current.status, "completion skipped");
            return Ok(false);
        }
        if !tables::is_closed(tx.conn(), &tables).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        archive_job(tx.conn(), &namespace(&run), &tables, op).await?;
        WorkflowStorage::transition_job(tx.conn(), job_id, JobEvent::Complete).await?;
        tx.commit().await?;

        self.supervisor.cancel(job_id);
        tracing::info!("✅ Job {} ({}) completed", job_id, op.operator);

        let run = self.storage.require_run(run.id).await?;
        if run.status == RunStatus::Running {
            self.continue_run(&run, &program, position + 1).await?;
        }
        Ok(true)
    }

    async fn finish_run(&self, run_id: i64) -> Result<()> {
        let mut tx = self.db.lock().await?;
        WorkflowStorage::transition_run(tx.conn(), run_id, RunEvent::Finish).await?;
        tx.commit().await?;

        self.registry.evict(run_id);
        self.supervisor.cancel_run(run_id);
        let run = self.storage.require_run(run_id).await?;
        tracing::info!("🎉 Run {} completed", run_id);

        if let Some(url) = run.notification_url.clone() {
            let notifier = self.notifier.clone();
            let notification = RunNotification {
                run_id,
                status: run.status,
                completed_at: run.completed_at,
            };
            tokio::spawn(async move {
                notifier.deliver(&url, &notification).await;
            });
        }
        Ok(())
    }

    /// Abort the run and every unfinished job. Returns false when the run had
    /// already ended.
    pub async fn abort_run(&self, run_id: i64, reason: &str) -> Result<bool> {
        let mut tx = self.db.lock().await?;
        let aborted_jobs = WorkflowStorage::abort_open_jobs(tx.conn(), run_id).await?;
        match WorkflowStorage::transition_run(tx.conn(), run_id, RunEvent::Abort).await {
            Ok(_) => {}
            Err(CymphonyError::InvalidTransition(_)) => {
                tx.rollback().await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        tx.commit().await?;

        self.supervisor.cancel_run(run_id);
        self.registry.evict(run_id);
        tracing::warn!("🛑 Run {} aborted ({} jobs): {}", run_id, aborted_jobs.len(), reason);
        Ok(true)
    }

    /// Pick up in-flight work after a process restart. RUNNING human jobs get
    /// their loops back (and a completion request if they closed while
    /// nothing was watching). RUNNING runs without a RUNNING human job were
    /// interrupted mid-walk and are walked again; completed jobs are skipped.
    /// Returns how many runs were resumed.
    pub async fn resume(self: &Arc<Self>) -> Result<usize> {
        let suspended = self.resume_human_jobs().await?;
        let mut resumed = suspended.len();

        for run in self.storage.running_runs().await? {
            if suspended.contains(&run.id) {
                continue;
            }
            let program = match self.registry.program(run.id).await {
                Ok(program) => program,
                Err(e) => {
                    tracing::error!("❌ Interrupted run {} has no usable program: {}", run.id, e);
                    continue;
                }
            };
            tracing::info!("🔄 Continuing interrupted run {}", run.id);
            if let Err(e) = self.continue_run(&run, &program, 0).await {
                tracing::error!("❌ Interrupted run {} could not continue: {}", run.id, e);
            }
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Returns the runs of the resumed jobs.
    async fn resume_human_jobs(self: &Arc<Self>) -> Result<HashSet<i64>> {
        let mut runs = HashSet::new();
        for job in self.storage.running_human_jobs().await? {
            let run = self.storage.require_run(job.run_id).await?;
            if run.status != RunStatus::Running {
                continue;
            }
            self.start_background(&run, job.id).await?;
            let params = label_params(&job)?;
            let closed = {
                let mut conn = self.db.connection().await?;
                tables::is_closed(&mut conn, &job_tables(&run, job.id, params)).await?
            };
            if closed {
                self.request_completion(job.id);
            }
            runs.insert(run.id);
        }
        if !runs.is_empty() {
            tracing::info!("🔄 Resumed running human jobs of {} runs", runs.len());
        }
        Ok(runs)
    }
}

pub(crate) fn label_params(job: &Job) -> Result<&crate::compiler::LabelParams> {
    job.params
        .label()
        .ok_or_else(|| CymphonyError::Configuration(format!("job {} is not a human job", job.id)))
}

pub(crate) fn operator_of<'p>(program: &'p Program, job: &Job) -> Result<(usize, &'p OperatorNode)> {
    let position = program
        .position_of(job.node_id)
        .ok_or_else(|| CymphonyError::CorruptState(format!("job {} node is not scheduled", job.id)))?;
    let (_, op) = program
        .operator_at(position)
        .ok_or_else(|| CymphonyError::CorruptState(format!("job {} node is not an operator", job.id)))?;
    Ok((position, op))
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_names_cannot_escape_the_run_directory() {
        assert!(is_plain_file_name("data.csv"));
        assert!(!is_plain_file_name("../data.csv"));
        assert!(!is_plain_file_name("a/b.csv"));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name(""));
    }
}
