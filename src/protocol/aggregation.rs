/// Vote aggregation and final-label commit
///
/// Votes are counted per population (regular or steward, by joining
/// `workers`; unknown workers count as regular). A value reaching the
/// population's threshold is the candidate, highest count first and earliest
/// vote breaking ties; otherwise the candidate is `undecided`. The candidate is
/// committed when the vote budget is exhausted or as soon as it reaches the
/// threshold. A final label is never written twice.

use super::assignment::{set_done, task_state};
use super::{is_labeled, HumanJob, Quoted};
use crate::compiler::UNDECIDED;
use crate::error::{CymphonyError, Result};
use crate::store::database::Database;
use crate::workflow::state::{AssignmentEvent, AssignmentStatus, TaskEvent, WorkerKind};
use crate::workflow::types::WorkerContext;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VoteOutcome {
    /// The assignment was no longer pending (reclaimed by the monitor), or the
    /// task does not exist; nothing was stored.
    Dropped,
    /// Vote stored. `finalized` carries the label if this vote committed one.
    Recorded { finalized: Option<String> },
}

/// Vote through the assignment path.
pub async fn submit(
    db: &Database,
    job: &HumanJob<'_>,
    worker: &WorkerContext,
    task_id: i64,
    answer: &str,
    now: i64,
) -> Result<VoteOutcome> {
    ensure_label(job, answer)?;
    let t = job.t();
    let mut tx = db.lock().await?;

    let completed = AssignmentStatus::PendingAnnotation.on(AssignmentEvent::Submit)?;
    let sql = format!(
        "UPDATE {} SET status = ? WHERE task_id = ? AND worker_id = ? AND status = ?",
        t.assignments
    );
    let flipped = sqlx::query(&sql)
        .bind(completed.as_str())
        .bind(task_id)
        .bind(worker.worker_id)
        .bind(AssignmentStatus::PendingAnnotation.as_str())
        .execute(tx.conn())
        .await?;
    if flipped.rows_affected() == 0 {
        tx.rollback().await?;
        tracing::warn!(
            job_id = job.job_id,
            task_id,
            worker_id = worker.worker_id,
            "vote dropped: assignment no longer pending"
        );
        return Ok(VoteOutcome::Dropped);
    }

    insert_vote(tx.conn(), &t, task_id, worker.worker_id, answer, now).await?;
    let finalized = decide(tx.conn(), job, worker.kind, task_id, true, now).await?;
    tx.commit().await?;
    Ok(VoteOutcome::Recorded { finalized })
}

/// Out-of-band vote with no assignment behind it.
pub async fn record_drive_by(
    db: &Database,
    job: &HumanJob<'_>,
    worker: &WorkerContext,
    task_id: i64,
    answer: &str,
    now: i64,
) -> Result<VoteOutcome> {
    ensure_label(job, answer)?;
    let t = job.t();
    let mut tx = db.lock().await?;

    let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", t.tasks);
    let (exists,): (i64,) = sqlx::query_as(&sql).bind(task_id).fetch_one(tx.conn()).await?;
    if exists == 0 {
        tx.rollback().await?;
        tracing::warn!(job_id = job.job_id, task_id, "drive-by vote for unknown task dropped");
        return Ok(VoteOutcome::Dropped);
    }

    insert_vote(tx.conn(), &t, task_id, worker.worker_id, answer, now).await?;
    let finalized = decide(tx.conn(), job, worker.kind, task_id, false, now).await?;
    tx.commit().await?;
    Ok(VoteOutcome::Recorded { finalized })
}

fn ensure_label(job: &HumanJob<'_>, answer: &str) -> Result<()> {
    if job.params.accepts(answer) {
        Ok(())
    } else {
        Err(CymphonyError::InvalidAnnotation {
            job_id: job.job_id,
            answer: answer.to_string(),
        })
    }
}

async fn insert_vote(
    conn: &mut SqliteConnection,
    t: &Quoted,
    task_id: i64,
    worker_id: i64,
    answer: &str,
    now: i64,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (task_id, worker_id, annotation, created_at) VALUES (?, ?, ?, ?)",
        t.outputs
    );
    sqlx::query(&sql)
        .bind(task_id)
        .bind(worker_id)
        .bind(answer)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Count the population's votes and commit, close or reopen the task.
/// Returns the label if one was committed by this call.
async fn decide(
    conn: &mut SqliteConnection,
    job: &HumanJob<'_>,
    population: WorkerKind,
    task_id: i64,
    release_pending: bool,
    now: i64,
) -> Result<Option<String>> {
    let t = job.t();
    let (threshold, budget) = job.thresholds(population);

    let sql = format!(
        "SELECT o.annotation, COUNT(*) AS votes, MIN(o.id) AS first_vote
         FROM {} o LEFT JOIN workers w ON w.id = o.worker_id
         WHERE o.task_id = ? AND COALESCE(w.kind, 'REGULAR') = ?
         GROUP BY o.annotation
         ORDER BY votes DESC, first_vote ASC",
        t.outputs
    );
    let tally: Vec<(String, i64, i64)> = sqlx::query_as(&sql)
        .bind(task_id)
        .bind(population.as_str())
        .fetch_all(&mut *conn)
        .await?;
    let total: i64 = tally.iter().map(|(_, votes, _)| votes).sum();
    let candidate = match tally.first() {
        Some((value, votes, _)) if *votes >= threshold => value.clone(),
        _ => UNDECIDED.to_string(),
    };

    let labeled = is_labeled(conn, &t, task_id).await?;
    let current = task_state(conn, &t, task_id).await?;
    let mut finalized = None;

    let next = if labeled {
        // late vote: stored, changes nothing
        current
    } else if total >= budget || candidate != UNDECIDED {
        let sql = format!(
            "INSERT INTO {} (task_id, label, created_at) VALUES (?, ?, ?)",
            t.final_labels
        );
        sqlx::query(&sql)
            .bind(task_id)
            .bind(&candidate)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        tracing::info!(job_id = job.job_id, task_id, label = %candidate, votes = total, "final label committed");
        finalized = Some(candidate);
        current.on(TaskEvent::Finalize, labeled)?
    } else if pending_in_population(conn, &t, task_id, population).await? == 0 {
        current.on(TaskEvent::Reopen, false)?
    } else {
        current
    };

    if release_pending && population == WorkerKind::Regular {
        let sql = format!(
            "UPDATE {} SET pending_annotations = MAX(pending_annotations - 1, 0) WHERE id = ?",
            t.tasks
        );
        sqlx::query(&sql).bind(task_id).execute(&mut *conn).await?;
    }
    set_done(conn, &t, task_id, next).await?;
    Ok(finalized)
}

async fn pending_in_population(
    conn: &mut SqliteConnection,
    t: &Quoted,
    task_id: i64,
    population: WorkerKind,
) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} a LEFT JOIN workers w ON w.id = a.worker_id
         WHERE a.task_id = ? AND a.status = 'PENDING_ANNOTATION' AND COALESCE(w.kind, 'REGULAR') = ?",
        t.assignments
    );
    let (count,): (i64,) = sqlx::query_as(&sql)
        .bind(task_id)
        .bind(population.as_str())
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Replay time-ordered votes and return the first value whose running count
/// reaches `k`. With no winner, `undecided` once `n` votes exist; `None`
/// while the task is still open.
pub fn first_to_threshold<S: AsRef<str>>(votes: &[S], k: u32, n: u32) -> Option<String> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for vote in votes {
        let count = counts.entry(vote.as_ref()).or_insert(0);
        *count += 1;
        if *count >= k {
            return Some(vote.as_ref().to_string());
        }
    }
    if votes.len() >= n as usize {
        Some(UNDECIDED.to_string())
    } else {
        None
    }
}
