/// Task assignment, voluntary skip and timeout reclamation
///
/// `assign` hands one open task to a worker under the store's write lock.
/// `skip` and the monitor's `sweep_expired` both funnel into `reopen`, the
/// single transition that gives a task back after an assignment is abandoned.

use super::{active_steward_assignments, is_labeled, HumanJob, Quoted};
use crate::error::{CymphonyError, Result};
use crate::store::database::Database;
use crate::store::job_tables;
use crate::workflow::state::{AssignmentEvent, AssignmentStatus, TaskEvent, TaskState, WorkerKind};
use crate::workflow::types::WorkerContext;
use serde::Serialize;
use sqlx::SqliteConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignOutcome {
    Assigned { task_id: i64 },
    /// Nothing assignable right now; retry later.
    NoTaskAvailable,
    /// Every task has a final label.
    JobClosed,
}

/// Hand one open, unvoted task to `worker`.
pub async fn assign(
    db: &Database,
    job: &HumanJob<'_>,
    worker: &WorkerContext,
    timeout_secs: i64,
    now: i64,
) -> Result<AssignOutcome> {
    {
        let mut conn = db.connection().await?;
        if job_tables::is_closed(&mut conn, job.tables).await? {
            return Ok(AssignOutcome::JobClosed);
        }
    }

    let t = job.t();
    let mut tx = db.lock().await?;

    let select = format!(
        "SELECT t.id FROM {tasks} t
         WHERE t.done = 0
           AND NOT EXISTS (SELECT 1 FROM {assignments} a
                           WHERE a.task_id = t.id AND a.worker_id = ?1 AND a.status != 'ABANDONED')
           AND NOT EXISTS (SELECT 1 FROM {outputs} o WHERE o.task_id = t.id AND o.worker_id = ?1)
           AND NOT EXISTS (SELECT 1 FROM {labels} f WHERE f.task_id = t.id)
         ORDER BY t.id LIMIT 1",
        tasks = t.tasks,
        assignments = t.assignments,
        outputs = t.outputs,
        labels = t.final_labels,
    );
    let candidate: Option<(i64,)> = sqlx::query_as(&select)
        .bind(worker.worker_id)
        .fetch_optional(tx.conn())
        .await?;
    let Some((task_id,)) = candidate else {
        tx.rollback().await?;
        return Ok(AssignOutcome::NoTaskAvailable);
    };

    let insert = format!(
        "INSERT INTO {} (task_id, worker_id, status, created_at, timeout_threshold_at) VALUES (?, ?, ?, ?, ?)",
        t.assignments
    );
    sqlx::query(&insert)
        .bind(task_id)
        .bind(worker.worker_id)
        .bind(AssignmentStatus::PendingAnnotation.as_str())
        .bind(now)
        .bind(now + timeout_secs.saturating_mul(1000))
        .execute(tx.conn())
        .await?;

    let pending = pending_for(tx.conn(), &t, task_id, worker.worker_id).await?;
    if pending > 1 {
        tx.rollback().await?;
        tracing::error!(
            job_id = job.job_id,
            task_id,
            worker_id = worker.worker_id,
            pending,
            "more than one pending assignment for the same task and worker"
        );
        return Err(CymphonyError::ConcurrencyInvariantViolation {
            task_id,
            worker_id: worker.worker_id,
            pending,
        });
    }

    match worker.kind {
        WorkerKind::Regular => {
            let (k, _) = job.thresholds(WorkerKind::Regular);
            let sql = format!(
                "UPDATE {} SET total_assigned = total_assigned + 1,
                               pending_annotations = pending_annotations + 1,
                               done = (total_assigned + 1 - abandoned) >= ?
                 WHERE id = ?",
                t.tasks
            );
            sqlx::query(&sql)
                .bind(k)
                .bind(task_id)
                .execute(tx.conn())
                .await?;
        }
        WorkerKind::Steward => {
            let (l, _) = job.thresholds(WorkerKind::Steward);
            let active = active_steward_assignments(tx.conn(), &t, task_id).await?;
            let state = if active >= l {
                TaskState::Open.on(TaskEvent::Saturate, false)?
            } else {
                TaskState::Open
            };
            set_done(tx.conn(), &t, task_id, state).await?;
        }
    }

    tx.commit().await?;
    tracing::debug!(job_id = job.job_id, task_id, worker_id = worker.worker_id, "task assigned");
    Ok(AssignOutcome::Assigned { task_id })
}

/// Give back the caller's pending assignment. Returns false when there was
/// nothing pending to give back.
pub async fn skip(db: &Database, job: &HumanJob<'_>, worker: &WorkerContext, task_id: i64) -> Result<bool> {
    let t = job.t();
    let mut tx = db.lock().await?;
    let abandoned = abandon(tx.conn(), &t, task_id, worker.worker_id, AssignmentEvent::Skip).await?;
    if !abandoned {
        tx.rollback().await?;
        return Ok(false);
    }
    reopen(tx.conn(), job, task_id, worker.kind).await?;
    tx.commit().await?;
    tracing::debug!(job_id = job.job_id, task_id, worker_id = worker.worker_id, "assignment skipped");
    Ok(true)
}

/// Abandon every pending assignment whose timeout has passed and reopen its
/// task, using the owner's group membership to pick the bookkeeping.
pub async fn sweep_expired(db: &Database, job: &HumanJob<'_>, now: i64) -> Result<usize> {
    let t = job.t();
    let mut tx = db.lock().await?;

    let select = format!(
        "SELECT a.task_id, a.worker_id, COALESCE(w.kind, 'REGULAR')
         FROM {} a LEFT JOIN workers w ON w.id = a.worker_id
         WHERE a.status = 'PENDING_ANNOTATION' AND a.timeout_threshold_at <= ?
         ORDER BY a.id",
        t.assignments
    );
    let expired: Vec<(i64, i64, String)> = sqlx::query_as(&select)
        .bind(now)
        .fetch_all(tx.conn())
        .await?;

    let mut reclaimed = 0;
    for (task_id, worker_id, kind) in expired {
        let kind: WorkerKind = kind
            .parse()
            .map_err(|e: crate::workflow::state::UnknownStatus| CymphonyError::CorruptState(e.to_string()))?;
        if abandon(tx.conn(), &t, task_id, worker_id, AssignmentEvent::Timeout).await? {
            reopen(tx.conn(), job, task_id, kind).await?;
            reclaimed += 1;
        }
    }

    tx.commit().await?;
    if reclaimed > 0 {
        tracing::info!(job_id = job.job_id, reclaimed, "reclaimed timed-out assignments");
    }
    Ok(reclaimed)
}

/// Flip a pending assignment to ABANDONED. Single conditional update, so a
/// concurrent submit or sweep that got there first wins.
async fn abandon(
    conn: &mut SqliteConnection,
    t: &Quoted,
    task_id: i64,
    worker_id: i64,
    event: AssignmentEvent,
) -> Result<bool> {
    let next = AssignmentStatus::PendingAnnotation.on(event)?;
    let sql = format!(
        "UPDATE {} SET status = ? WHERE task_id = ? AND worker_id = ? AND status = ?",
        t.assignments
    );
    let done = sqlx::query(&sql)
        .bind(next.as_str())
        .bind(task_id)
        .bind(worker_id)
        .bind(AssignmentStatus::PendingAnnotation.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// Return a task to the pool after an abandonment.
///
/// Regular: abandoned + 1, pending - 1 (floored at 0), done = false.
/// Steward: done = active steward assignments >= l.
/// A task that already has a final label stays closed either way.
pub(crate) async fn reopen(conn: &mut SqliteConnection, job: &HumanJob<'_>, task_id: i64, kind: WorkerKind) -> Result<()> {
    let t = job.t();
    let labeled = is_labeled(conn, &t, task_id).await?;

    match kind {
        WorkerKind::Regular => {
            let current = task_state(conn, &t, task_id).await?;
            let next = current.on(TaskEvent::Reopen, labeled)?;
            let sql = format!(
                "UPDATE {} SET abandoned = abandoned + 1,
                               pending_annotations = MAX(pending_annotations - 1, 0),
                               done = ?
                 WHERE id = ?",
                t.tasks
            );
            sqlx::query(&sql)
                .bind(next.is_done())
                .bind(task_id)
                .execute(&mut *conn)
                .await?;
        }
        WorkerKind::Steward => {
            let (l, _) = job.thresholds(WorkerKind::Steward);
            let active = active_steward_assignments(conn, &t, task_id).await?;
            let next = if labeled {
                TaskState::Closed
            } else {
                TaskState::from_done(active >= l)
            };
            set_done(conn, &t, task_id, next).await?;
        }
    }
    Ok(())
}

pub(crate) async fn task_state(conn: &mut SqliteConnection, t: &Quoted, task_id: i64) -> Result<TaskState> {
    let sql = format!("SELECT done FROM {} WHERE id = ?", t.tasks);
    let row: Option<(i64,)> = sqlx::query_as(&sql).bind(task_id).fetch_optional(&mut *conn).await?;
    let (done,) = row.ok_or_else(|| CymphonyError::not_found("task", task_id))?;
    Ok(TaskState::from_done(done != 0))
}

pub(crate) async fn set_done(conn: &mut SqliteConnection, t: &Quoted, task_id: i64, state: TaskState) -> Result<()> {
    let sql = format!("UPDATE {} SET done = ? WHERE id = ?", t.tasks);
    sqlx::query(&sql)
        .bind(state.is_done())
        .bind(task_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn pending_for(conn: &mut SqliteConnection, t: &Quoted, task_id: i64, worker_id: i64) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE task_id = ? AND worker_id = ? AND status = 'PENDING_ANNOTATION'",
        t.assignments
    );
    let (count,): (i64,) = sqlx::query_as(&sql)
        .bind(task_id)
        .bind(worker_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}
