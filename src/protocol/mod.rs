/// Task assignment and vote aggregation protocols
///
/// Both run entirely inside `LockedTx` transactions against the job's tables.
/// There is no in-process state: the store's write lock is the only
/// coordination between concurrent workers, the monitor and drive-by curation.
///
/// Regular workers use the k-of-n bookkeeping on the task row
/// (total_assigned, abandoned, pending_annotations, done). Stewards use l-of-m
/// and only ever touch `done`. Both share the same `done` flag, so a steward
/// reopening a task can undo a closing decision made by the regular protocol.

pub mod aggregation;
pub mod assignment;

use crate::compiler::LabelParams;
use crate::store::naming::{quote_ident, JobTables};
use crate::error::Result;
use crate::workflow::state::WorkerKind;
use serde::Serialize;
use sqlx::SqliteConnection;

pub use aggregation::{first_to_threshold, VoteOutcome};
pub use assignment::AssignOutcome;

/// A human job as the protocols see it.
#[derive(Debug, Clone, Copy)]
pub struct HumanJob<'a> {
    pub job_id: i64,
    pub tables: &'a JobTables,
    pub params: &'a LabelParams,
}

impl HumanJob<'_> {
    /// (consensus threshold, vote budget) for a population.
    pub fn thresholds(&self, kind: WorkerKind) -> (i64, i64) {
        match kind {
            WorkerKind::Regular => (self.params.k as i64, self.params.n as i64),
            WorkerKind::Steward => (self.params.l as i64, self.params.m as i64),
        }
    }

    pub(crate) fn t(&self) -> Quoted {
        Quoted {
            tasks: quote_ident(&self.tables.tasks),
            assignments: quote_ident(&self.tables.assignments),
            outputs: quote_ident(&self.tables.outputs),
            final_labels: quote_ident(&self.tables.final_labels),
        }
    }
}

/// Quoted table names for SQL formatting.
pub(crate) struct Quoted {
    pub tasks: String,
    pub assignments: String,
    pub outputs: String,
    pub final_labels: String,
}

/// Current bookkeeping of one task, for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub id: i64,
    pub total_assigned: i64,
    pub abandoned: i64,
    pub pending_annotations: i64,
    pub done: bool,
    pub label: Option<String>,
}

pub async fn task_snapshot(conn: &mut SqliteConnection, job: &HumanJob<'_>, task_id: i64) -> Result<Option<TaskSnapshot>> {
    let t = job.t();
    let sql = format!(
        "SELECT t.id, t.total_assigned, t.abandoned, t.pending_annotations, t.done, f.label
         FROM {} t LEFT JOIN {} f ON f.task_id = t.id WHERE t.id = ?",
        t.tasks, t.final_labels
    );
    let row: Option<(i64, i64, i64, i64, i64, Option<String>)> =
        sqlx::query_as(&sql).bind(task_id).fetch_optional(&mut *conn).await?;
    Ok(row.map(
        |(id, total_assigned, abandoned, pending_annotations, done, label)| TaskSnapshot {
            id,
            total_assigned,
            abandoned,
            pending_annotations,
            done: done != 0,
            label,
        },
    ))
}

/// Committed labels of a job's tables, ordered by task id.
pub async fn final_labels(conn: &mut SqliteConnection, tables: &JobTables) -> Result<Vec<(i64, String)>> {
    let sql = format!(
        "SELECT task_id, label FROM {} ORDER BY task_id",
        quote_ident(&tables.final_labels)
    );
    Ok(sqlx::query_as(&sql).fetch_all(&mut *conn).await?)
}

pub(crate) async fn is_labeled(conn: &mut SqliteConnection, t: &Quoted, task_id: i64) -> Result<bool> {
    let sql = format!("SELECT EXISTS (SELECT 1 FROM {} WHERE task_id = ?)", t.final_labels);
    let (labeled,): (i64,) = sqlx::query_as(&sql).bind(task_id).fetch_one(&mut *conn).await?;
    Ok(labeled != 0)
}

/// Pending or completed assignments held by stewards on a task.
pub(crate) async fn active_steward_assignments(conn: &mut SqliteConnection, t: &Quoted, task_id: i64) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} a JOIN workers w ON w.id = a.worker_id
         WHERE a.task_id = ? AND w.kind = 'STEWARD' AND a.status IN ('PENDING_ANNOTATION', 'COMPLETED')",
        t.assignments
    );
    let (count,): (i64,) = sqlx::query_as(&sql).bind(task_id).fetch_one(&mut *conn).await?;
    Ok(count)
}
