/// Abandonment monitor
///
/// A repeated tokio-cron-scheduler job that sweeps every RUNNING local human
/// job for pending assignments past their timeout and hands the tasks back.

use crate::error::Result;
use crate::protocol::{assignment, HumanJob};
use crate::runtime::engine::job_tables;
use crate::runtime::lifecycle::label_params;
use crate::store::database::Database;
use crate::workflow::storage::WorkflowStorage;
use crate::workflow::types::{self, now_millis};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub struct AbandonmentMonitor {
    db: Database,
    storage: WorkflowStorage,
    /// Running scheduler and the uuid of the sweep job
    scheduler: Mutex<Option<(JobScheduler, Uuid)>>,
}

impl std::fmt::Debug for AbandonmentMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbandonmentMonitor").finish_non_exhaustive()
    }
}

impl AbandonmentMonitor {
    pub fn new(db: Database, storage: WorkflowStorage) -> Self {
        Self {
            db,
            storage,
            scheduler: Mutex::new(None),
        }
    }

    /// One sweep over every running local human job as of `now` (epoch
    /// millis). Returns how many assignments were abandoned. A job that fails
    /// to sweep is logged and skipped.
    pub async fn sweep_at(&self, now: i64) -> Result<usize> {
        let mut abandoned = 0;
        for job in self.storage.running_human_jobs().await? {
            if !job.is_local_human() {
                continue;
            }
            match self.sweep_job(&job, now).await {
                Ok(0) => {}
                Ok(swept) => {
                    tracing::info!(job_id = job.id, "⏰ Abandoned {} expired assignments", swept);
                    abandoned += swept;
                }
                Err(e) => tracing::warn!(job_id = job.id, "⚠️ Sweep skipped job: {}", e),
            }
        }
        Ok(abandoned)
    }

    async fn sweep_job(&self, job: &types::Job, now: i64) -> Result<usize> {
        let run = self.storage.require_run(job.run_id).await?;
        let params = label_params(job)?;
        let tables = job_tables(&run, job.id, params);
        let human = HumanJob {
            job_id: job.id,
            tables: &tables,
            params,
        };
        assignment::sweep_expired(&self.db, &human, now).await
    }

    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_at(now_millis()).await
    }

    /// Register the repeated sweep and start the scheduler.
    pub async fn start(self: &Arc<Self>, interval: Duration) -> anyhow::Result<()> {
        tracing::info!("⏰ Starting abandonment monitor every {:?}", interval);
        let scheduler = JobScheduler::new().await?;

        let monitor = Arc::clone(self);
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let monitor = Arc::clone(&monitor);
            Box::pin(async move {
                if let Err(e) = monitor.sweep().await {
                    tracing::error!("❌ Abandonment sweep failed: {}", e);
                }
            })
        })?;
        let sweep = scheduler.add(job).await?;
        scheduler.start().await?;
        tracing::debug!("📝 Sweep job registered as {}", sweep);

        *self.scheduler.lock().await = Some((scheduler, sweep));
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        if let Some((mut scheduler, sweep)) = self.scheduler.lock().await.take() {
            scheduler.remove(&sweep).await?;
            scheduler.shutdown().await?;
            tracing::info!("⏹️ Abandonment monitor stopped");
        }
        Ok(())
    }
}
