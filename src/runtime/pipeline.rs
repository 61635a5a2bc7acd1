/// Pipelined streaming of partial human-job results
///
/// While a local human job of a pipelined run is RUNNING, each tick appends
/// the rows finalized since the previous tick to the job's labeled table,
/// exposes them as the variable's delta table and pushes that delta through
/// the automatic operators downstream, up to the next human operator.
///
/// Streamed outputs are provisional: once the job closes, the batch walk
/// recomputes those operators over the full tables.

use crate::error::{CymphonyError, Result};
use crate::runtime::engine::{job_tables, namespace};
use crate::runtime::executor::Deltas;
use crate::runtime::lifecycle::{label_params, operator_of, RunController};
use crate::store::job_tables;
use crate::workflow::state::JobStatus;
use serde::Serialize;

/// What one streaming tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamTick {
    /// Rows finalized since the previous tick.
    pub new_rows: u64,
    /// Downstream operators that consumed them.
    pub operators: usize,
    /// Every task is labeled (or the job is no longer running).
    pub closed: bool,
}

impl RunController {
    pub async fn stream_once(&self, job_id: i64) -> Result<StreamTick> {
        let job = self.storage().require_job(job_id).await?;
        if job.status != JobStatus::Running {
            return Ok(StreamTick {
                new_rows: 0,
                operators: 0,
                closed: true,
            });
        }
        let run = self.storage().require_run(job.run_id).await?;
        let program = self.registry().program(run.id).await?;
        let (position, op) = operator_of(&program, &job)?;
        let params = label_params(&job)?;
        let tables = job_tables(&run, job.id, params);
        let ns = namespace(&run);
        let labeled = op
            .outputs
            .first()
            .ok_or_else(|| CymphonyError::CorruptState(format!("job {} has no output variable", job.id)))?;

        let mut tx = self.database().lock().await?;
        let new_rows =
            job_tables::stream_new_labels(tx.conn(), &tables, &ns.table(labeled), &ns.delta_table(labeled)).await?;
        if let Some(votes) = op.outputs.get(1) {
            job_tables::archive_votes(tx.conn(), &tables, &ns.table(votes)).await?;
        }
        let closed = job_tables::is_closed(tx.conn(), &tables).await?;
        tx.commit().await?;

        let mut operators = 0;
        if new_rows > 0 {
            let mut deltas = Deltas::new();
            deltas.insert(labeled.clone(), ns.delta_table(labeled));
            operators = self.engine().scoped_walk(&run, &program, position, deltas).await?;
            tracing::info!(
                job_id,
                new_rows,
                operators,
                "🌊 Streamed {} into run {}",
                labeled,
                run.id
            );
        }

        Ok(StreamTick {
            new_rows,
            operators,
            closed,
        })
    }
}
