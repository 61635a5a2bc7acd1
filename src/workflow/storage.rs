/// SQLite persistence for the catalog: workflows, runs, jobs, compiled graphs
/// and worker membership
///
/// Reads go through the pool. Writes that must be atomic with other state
/// (run creation, status transitions) take a connection so they can run inside
/// the caller's `LockedTx`.

use crate::compiler::{Graph, Node, NodeId, OperatorParams, Program};
use crate::error::{CymphonyError, Result};
use crate::workflow::state::{JobEvent, JobKind, JobStatus, RunEvent, RunStatus, WorkerKind};
use crate::workflow::types::{now_millis, Job, NewWorkflow, Run, RunOptions, Workflow, WorkerContext};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

const RUN_COLUMNS: &str =
    "id, workflow_id, project_id, user_id, name, status, run_type, notification_url, created_at, completed_at";
const JOB_COLUMNS: &str =
    "id, run_id, workflow_id, project_id, user_id, node_id, operator, kind, status, params, created_at, completed_at";

impl WorkflowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_workflow(&self, new: &NewWorkflow) -> Result<i64> {
        let artifacts = serde_json::to_string(&new.artifacts)?;
        let result = sqlx::query(
            r#"
            INSERT INTO workflows (project_id, user_id, name, description, artifacts, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.project_id)
        .bind(new.user_id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(&artifacts)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_workflow(&self, id: i64) -> Result<Option<Workflow>> {
        let row = sqlx::query(
            "SELECT id, project_id, user_id, name, description, artifacts, created_at FROM workflows WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let artifacts: String = row.try_get("artifacts")?;
                Ok(Some(Workflow {
                    id: row.try_get("id")?,
                    project_id: row.try_get("project_id")?,
                    user_id: row.try_get("user_id")?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    artifacts: serde_json::from_str(&artifacts)?,
                    created_at: row.try_get("created_at")?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Insert an IDLE run together with its compiled graph, schedule and one
    /// IDLE job per operator node.
    pub async fn insert_run(
        &self,
        conn: &mut SqliteConnection,
        workflow: &Workflow,
        options: &RunOptions,
        program: &Program,
    ) -> Result<Run> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO runs (workflow_id, project_id, user_id, name, status, run_type, notification_url, created_at)
            VALUES (?, ?, ?, '', ?, ?, ?, ?)
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.project_id)
        .bind(workflow.user_id)
        .bind(RunStatus::Idle.as_str())
        .bind(options.run_type.as_str())
        .bind(options.notification_url.as_deref())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        let run_id = result.last_insert_rowid();

        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{} #{}", workflow.name, run_id));
        sqlx::query("UPDATE runs SET name = ? WHERE id = ?")
            .bind(&name)
            .bind(run_id)
            .execute(&mut *conn)
            .await?;

        for (node_id, node) in program.graph.nodes() {
            sqlx::query("INSERT INTO nodes (run_id, node_id, name, kind, definition) VALUES (?, ?, ?, ?, ?)")
                .bind(run_id)
                .bind(node_id as i64)
                .bind(&node.name)
                .bind(node.kind_name())
                .bind(serde_json::to_string(node)?)
                .execute(&mut *conn)
                .await?;
        }
        for (origin, destination) in program.graph.edges() {
            sqlx::query("INSERT INTO edges (run_id, origin, destination) VALUES (?, ?, ?)")
                .bind(run_id)
                .bind(origin as i64)
                .bind(destination as i64)
                .execute(&mut *conn)
                .await?;
        }
        for (position, node_id) in program.schedule.iter().enumerate() {
            sqlx::query("INSERT INTO schedule (run_id, node_id, position) VALUES (?, ?, ?)")
                .bind(run_id)
                .bind(*node_id as i64)
                .bind(position as i64)
                .execute(&mut *conn)
                .await?;
        }

        for &node_id in &program.schedule {
            let Some(op) = program.graph.node(node_id).and_then(|n| n.as_operator()) else {
                continue;
            };
            sqlx::query(
                r#"
                INSERT INTO jobs (run_id, workflow_id, project_id, user_id, node_id, operator, kind, status, params, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(workflow.id)
            .bind(workflow.project_id)
            .bind(workflow.user_id)
            .bind(node_id as i64)
            .bind(op.operator.name())
            .bind(op.operator.kind().as_str())
            .bind(JobStatus::Idle.as_str())
            .bind(serde_json::to_string(&op.params)?)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }

        Ok(Run {
            id: run_id,
            workflow_id: workflow.id,
            project_id: workflow.project_id,
            user_id: workflow.user_id,
            name,
            status: RunStatus::Idle,
            run_type: options.run_type,
            notification_url: options.notification_url.clone(),
            created_at: now,
            completed_at: None,
        })
    }

    pub async fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?", RUN_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    pub async fn runs_for_workflow(&self, workflow_id: i64) -> Result<Vec<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE workflow_id = ? ORDER BY id", RUN_COLUMNS);
        let rows = sqlx::query(&sql).bind(workflow_id).fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn running_runs(&self) -> Result<Vec<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE status = ? ORDER BY id", RUN_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(RunStatus::Running.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn require_run(&self, id: i64) -> Result<Run> {
        self.get_run(id)
            .await?
            .ok_or_else(|| CymphonyError::not_found("run", id))
    }

    /// Apply `event` to the run's status under the caller's lock.
    pub async fn transition_run(conn: &mut SqliteConnection, run_id: i64, event: RunEvent) -> Result<RunStatus> {
        let (status,): (String,) = sqlx::query_as("SELECT status FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| CymphonyError::not_found("run", run_id))?;
        let next = parse::<RunStatus>(&status)?.on(event)?;
        let completed_at = next.is_terminal().then(now_millis);
        sqlx::query("UPDATE runs SET status = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?")
            .bind(next.as_str())
            .bind(completed_at)
            .bind(run_id)
            .execute(&mut *conn)
            .await?;
        Ok(next)
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn require_job(&self, id: i64) -> Result<Job> {
        self.get_job(id)
            .await?
            .ok_or_else(|| CymphonyError::not_found("job", id))
    }

    /// Job row read under the caller's lock.
    pub async fn job_locked(conn: &mut SqliteConnection, id: i64) -> Result<Job> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| CymphonyError::not_found("job", id))?;
        job_from_row(&row)
    }

    pub async fn job_for_node(&self, run_id: i64, node_id: NodeId) -> Result<Job> {
        let sql = format!("SELECT {} FROM jobs WHERE run_id = ? AND node_id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(node_id as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                CymphonyError::CorruptState(format!("run {} has no job for node {}", run_id, node_id))
            })?;
        job_from_row(&row)
    }

    pub async fn jobs_for_run(&self, run_id: i64) -> Result<Vec<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE run_id = ? ORDER BY id", JOB_COLUMNS);
        let rows = sqlx::query(&sql).bind(run_id).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn running_jobs(&self, run_id: i64) -> Result<Vec<Job>> {
        Ok(self
            .jobs_for_run(run_id)
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Running)
            .collect())
    }

    /// Every RUNNING human job across all runs.
    pub async fn running_human_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE status = ? AND kind = ? ORDER BY id",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(JobStatus::Running.as_str())
            .bind(JobKind::Human.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Apply `event` to the job's status under the caller's lock.
    pub async fn transition_job(conn: &mut SqliteConnection, job_id: i64, event: JobEvent) -> Result<JobStatus> {
        let (status,): (String,) = sqlx::query_as("SELECT status FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| CymphonyError::not_found("job", job_id))?;
        let next = parse::<JobStatus>(&status)?.on(event)?;
        let completed_at = (next == JobStatus::Completed).then(now_millis);
        sqlx::query("UPDATE jobs SET status = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?")
            .bind(next.as_str())
            .bind(completed_at)
            .bind(job_id)
            .execute(&mut *conn)
            .await?;
        Ok(next)
    }

    /// Abort every job of the run that has not finished yet.
    pub async fn abort_open_jobs(conn: &mut SqliteConnection, run_id: i64) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM jobs WHERE run_id = ? AND status IN (?, ?)")
            .bind(run_id)
            .bind(JobStatus::Idle.as_str())
            .bind(JobStatus::Running.as_str())
            .fetch_all(&mut *conn)
            .await?;
        for (id,) in &ids {
            Self::transition_job(conn, *id, JobEvent::Abort).await?;
        }
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Rebuild a run's compiled program from its persisted graph rows.
    pub async fn load_program(&self, run_id: i64) -> Result<Program> {
        let rows = sqlx::query("SELECT node_id, definition FROM nodes WHERE run_id = ? ORDER BY node_id")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Err(CymphonyError::not_found("run graph", run_id));
        }
        let mut nodes = Vec::with_capacity(rows.len());
        for (expected, row) in rows.iter().enumerate() {
            let node_id: i64 = row.try_get("node_id")?;
            if node_id != expected as i64 {
                return Err(CymphonyError::CorruptState(format!(
                    "run {} graph has a gap at node {}",
                    run_id, expected
                )));
            }
            let definition: String = row.try_get("definition")?;
            nodes.push(serde_json::from_str::<Node>(&definition)?);
        }

        let edges: Vec<(i64, i64)> = sqlx::query_as("SELECT origin, destination FROM edges WHERE run_id = ?")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        let edges: Vec<(NodeId, NodeId)> = edges
            .into_iter()
            .map(|(a, b)| (a as NodeId, b as NodeId))
            .collect();

        let schedule: Vec<(i64,)> = sqlx::query_as("SELECT node_id FROM schedule WHERE run_id = ? ORDER BY position")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(Program {
            graph: Graph::from_parts(nodes, &edges),
            schedule: schedule.into_iter().map(|(id,)| id as NodeId).collect(),
        })
    }

    pub async fn upsert_worker(&self, worker_id: i64, kind: WorkerKind) -> Result<()> {
        sqlx::query("INSERT INTO workers (id, kind) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET kind = excluded.kind")
            .bind(worker_id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unknown workers count as regular.
    pub async fn worker_context(&self, worker_id: i64) -> Result<WorkerContext> {
        let kind: Option<(String,)> = sqlx::query_as("SELECT kind FROM workers WHERE id = ?")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        let kind = match kind {
            Some((k,)) => parse::<WorkerKind>(&k)?,
            None => WorkerKind::Regular,
        };
        Ok(WorkerContext { worker_id, kind })
    }
}

fn parse<T>(value: &str) -> Result<T>
where
    T: FromStr<Err = crate::workflow::state::UnknownStatus>,
{
    value
        .parse()
        .map_err(|e: crate::workflow::state::UnknownStatus| CymphonyError::CorruptState(e.to_string()))
}

fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let status: String = row.try_get("status")?;
    let run_type: String = row.try_get("run_type")?;
    Ok(Run {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        project_id: row.try_get("project_id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        status: parse(&status)?,
        run_type: parse(&run_type)?,
        notification_url: row.try_get("notification_url")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let operator: String = row.try_get("operator")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let params: String = row.try_get("params")?;
    let node_id: i64 = row.try_get("node_id")?;
    Ok(Job {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        workflow_id: row.try_get("workflow_id")?,
        project_id: row.try_get("project_id")?,
        user_id: row.try_get("user_id")?,
        node_id: node_id as NodeId,
        operator: crate::compiler::Operator::from_name(&operator)
            .ok_or_else(|| CymphonyError::CorruptState(format!("unknown operator '{}'", operator)))?,
        kind: parse(&kind)?,
        status: parse(&status)?,
        params: serde_json::from_str::<OperatorParams>(&params)?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
