/// Publish a provider job's tasks and fold polled votes into its `amt_` tables
///
/// Provider votes arrive with their own timestamps, possibly repeated across
/// polls. Each (task, worker) vote is stored once; every open task then
/// replays its votes in submission order and commits the first value to reach
/// `k`, or `undecided` once `n` votes exist.

use super::{HitBatch, HitSpec, ProviderAdapter, ProviderHandle};
use crate::error::Result;
use crate::protocol::{first_to_threshold, HumanJob};
use crate::store::database::Database;
use crate::store::naming::quote_ident;
use crate::store::rows;
use crate::workflow::types::now_millis;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub new_votes: u64,
    pub finalized: u64,
}

/// Split the job's tuples into batches and publish them. Handles are recorded
/// in the job's hits table and on each task row.
pub async fn publish(
    db: &Database,
    adapter: &dyn ProviderAdapter,
    job: &HumanJob<'_>,
    spec: &HitSpec,
) -> Result<Vec<ProviderHandle>> {
    let batches = {
        let mut conn = db.connection().await?;
        let (headers, data) = rows::fetch_text(&mut conn, &job.tables.tuples).await?;
        batch_rows(&headers, data, job.params.batch_size.max(1) as usize)
    };
    if batches.is_empty() {
        return Ok(Vec::new());
    }

    let handles = adapter.publish(&batches, spec).await?;

    let mut tx = db.lock().await?;
    let hits = format!(
        "INSERT OR IGNORE INTO {} (hit_id, task_ids, created_at) VALUES (?, ?, ?)",
        quote_ident(&job.tables.hits)
    );
    let tasks = format!("UPDATE {} SET hit_id = ? WHERE id = ?", quote_ident(&job.tables.tasks));
    let now = now_millis();
    for handle in &handles {
        sqlx::query(&hits)
            .bind(&handle.hit_id)
            .bind(serde_json::to_string(&handle.task_ids)?)
            .bind(now)
            .execute(tx.conn())
            .await?;
        for task_id in &handle.task_ids {
            sqlx::query(&tasks)
                .bind(&handle.hit_id)
                .bind(task_id)
                .execute(tx.conn())
                .await?;
        }
    }
    tx.commit().await?;

    tracing::info!(job_id = job.job_id, hits = handles.len(), "provider job published");
    Ok(handles)
}

fn batch_rows(headers: &[String], data: Vec<Vec<Option<String>>>, size: usize) -> Vec<HitBatch> {
    let id_column = headers.iter().position(|h| h == "_id");
    let mut batches = Vec::new();
    let mut current = HitBatch {
        task_ids: Vec::new(),
        rows: Vec::new(),
    };
    for row in data {
        let task_id = id_column
            .and_then(|i| row.get(i).cloned().flatten())
            .and_then(|v| v.parse::<i64>().ok());
        let Some(task_id) = task_id else { continue };

        let mut object = Map::new();
        for (header, cell) in headers.iter().zip(row) {
            object.insert(header.clone(), cell.map(Value::String).unwrap_or(Value::Null));
        }
        current.task_ids.push(task_id);
        current.rows.push(object);
        if current.task_ids.len() == size {
            batches.push(std::mem::replace(
                &mut current,
                HitBatch {
                    task_ids: Vec::new(),
                    rows: Vec::new(),
                },
            ));
        }
    }
    if !current.task_ids.is_empty() {
        batches.push(current);
    }
    batches
}

/// Handles recorded for a job by `publish`.
pub async fn handles(db: &Database, job: &HumanJob<'_>) -> Result<Vec<ProviderHandle>> {
    let sql = format!(
        "SELECT hit_id, task_ids FROM {} ORDER BY created_at, hit_id",
        quote_ident(&job.tables.hits)
    );
    let rows: Vec<(String, String)> = sqlx::query_as(&sql).fetch_all(db.pool()).await?;
    rows.into_iter()
        .map(|(hit_id, task_ids)| {
            Ok(ProviderHandle {
                hit_id,
                task_ids: serde_json::from_str(&task_ids)?,
            })
        })
        .collect()
}

/// One poll: store new votes, then commit every task whose replay decides.
pub async fn poll_once(db: &Database, adapter: &dyn ProviderAdapter, job: &HumanJob<'_>) -> Result<PollSummary> {
    let handles = handles(db, job).await?;
    if handles.is_empty() {
        return Ok(PollSummary::default());
    }
    let votes = adapter.poll(&handles).await?;

    let outputs = quote_ident(&job.tables.outputs);
    let labels = quote_ident(&job.tables.final_labels);
    let tasks = quote_ident(&job.tables.tasks);
    let mut summary = PollSummary::default();

    let mut tx = db.lock().await?;
    let insert = format!(
        "INSERT OR IGNORE INTO {} (task_id, worker_id, annotation, created_at)
         SELECT ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM {} WHERE id = ?)",
        outputs, tasks
    );
    for vote in &votes {
        if !job.params.accepts(&vote.annotation) {
            tracing::warn!(
                job_id = job.job_id,
                task_id = vote.task_id,
                annotation = %vote.annotation,
                "provider vote outside the label set dropped"
            );
            continue;
        }
        summary.new_votes += sqlx::query(&insert)
            .bind(vote.task_id)
            .bind(&vote.worker_id)
            .bind(&vote.annotation)
            .bind(vote.submitted_at)
            .bind(vote.task_id)
            .execute(tx.conn())
            .await?
            .rows_affected();
    }

    let open = format!(
        "SELECT id FROM {} WHERE id NOT IN (SELECT task_id FROM {}) ORDER BY id",
        tasks, labels
    );
    let open: Vec<(i64,)> = sqlx::query_as(&open).fetch_all(tx.conn()).await?;
    let replay = format!(
        "SELECT annotation FROM {} WHERE task_id = ? ORDER BY created_at, id",
        outputs
    );
    let commit = format!("INSERT INTO {} (task_id, label, created_at) VALUES (?, ?, ?)", labels);
    let now = now_millis();
    for (task_id,) in open {
        let votes: Vec<(String,)> = sqlx::query_as(&replay).bind(task_id).fetch_all(tx.conn()).await?;
        let votes: Vec<String> = votes.into_iter().map(|(v,)| v).collect();
        if let Some(label) = first_to_threshold(votes.as_slice(), job.params.k, job.params.n) {
            sqlx::query(&commit)
                .bind(task_id)
                .bind(&label)
                .bind(now)
                .execute(tx.conn())
                .await?;
            tracing::info!(job_id = job.job_id, task_id, label = %label, "provider label committed");
            summary.finalized += 1;
        }
    }
    tx.commit().await?;

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_split_into_fixed_size_batches() {
        let headers = vec!["_id".to_string(), "text".to_string()];
        let data: Vec<Vec<Option<String>>> = (1..=5)
            .map(|i| vec![Some(i.to_string()), Some(format!("t{}", i))])
            .collect();
        let batches = batch_rows(&headers, data, 2);
        let ids: Vec<Vec<i64>> = batches.iter().map(|b| b.task_ids.clone()).collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(batches[2].rows[0]["text"], Value::String("t5".into()));
    }
}
