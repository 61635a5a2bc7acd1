/// Automatic operator execution against run-scoped SQLite tables
///
/// Each operator reads its input tables and (re)creates its output table. In
/// scoped mode (pipelined streaming) an operator only sees the delta tables of
/// its streamed inputs; its own output rows for the tick are written to a
/// delta table and appended to the output table.

use crate::compiler::{OperatorNode, OperatorParams};
use crate::error::{CymphonyError, Result};
use crate::store::naming::{quote_ident, RunNamespace};
use crate::store::rows;
use crate::tabular::{parse_csv, write_csv};
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where a run's files and tables live.
#[derive(Debug, Clone)]
pub struct RunScope {
    pub namespace: RunNamespace,
    pub run_dir: PathBuf,
}

impl RunScope {
    pub fn new(namespace: RunNamespace, data_dir: &Path) -> Self {
        let run_dir = namespace.run_dir(data_dir);
        Self { namespace, run_dir }
    }

    /// Snapshot of an uploaded workflow file.
    pub fn file(&self, name: &str) -> PathBuf {
        self.run_dir.join("files").join(name)
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.run_dir.join("outputs").join(name)
    }

    /// Audit export of an operator's output table.
    pub fn materialized(&self, variable: &str) -> PathBuf {
        self.run_dir.join("tables").join(format!("{}.csv", variable))
    }
}

/// Variable name → delta table holding the rows streamed in this tick.
pub type Deltas = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct OperatorExecutor {
    materialize_outputs: bool,
}

impl OperatorExecutor {
    pub fn new(materialize_outputs: bool) -> Self {
        Self { materialize_outputs }
    }

    /// Run an automatic operator over full input tables.
    pub async fn execute(&self, conn: &mut SqliteConnection, scope: &RunScope, op: &OperatorNode) -> Result<()> {
        tracing::debug!("⚙️ Executing {} (statement {})", op.operator, op.statement);
        match &op.params {
            OperatorParams::ReadTable { file } => {
                let output = scope.namespace.table(single_output(op)?);
                let text = tokio::fs::read_to_string(scope.file(file)).await?;
                let data = parse_csv(&text).map_err(|e| CymphonyError::Configuration(format!("{}: {}", file, e)))?;
                let rows = rows::create_from_csv(conn, &output, &data).await?;
                tracing::info!("📥 Loaded {} rows from {} into {}", rows, file, output);
            }
            OperatorParams::WriteTable { file } => {
                let input = scope.namespace.table(single_input(op)?);
                let (headers, data) = rows::fetch_text(conn, &input).await?;
                write_file(&scope.output(file), &write_csv(&headers, &data, true), false).await?;
                tracing::info!("📤 Exported {} rows to {}", data.len(), file);
            }
            OperatorParams::SampleRandom { size } => {
                let input = scope.namespace.table(single_input(op)?);
                let output = scope.namespace.table(single_output(op)?);
                let limit = sample_limit(*size)?;
                rows::drop_table(conn, &output).await?;
                let sql = format!(
                    "CREATE TABLE {} AS SELECT * FROM {} ORDER BY RANDOM() LIMIT {}",
                    quote_ident(&output),
                    quote_ident(&input),
                    limit
                );
                sqlx::query(&sql).execute(&mut *conn).await?;
            }
            OperatorParams::ExecSql { query } => {
                let output = scope.namespace.table(single_output(op)?);
                let bindings: Vec<(String, String)> = op
                    .inputs
                    .iter()
                    .map(|var| (var.clone(), scope.namespace.table(var)))
                    .collect();
                rows::drop_table(conn, &output).await?;
                exec_sql(conn, query, &bindings, &output).await?;
            }
            OperatorParams::Label(_) => {
                return Err(CymphonyError::Configuration(format!(
                    "{} is a human operator and cannot run inline",
                    op.operator
                )));
            }
        }
        self.materialize(conn, scope, op).await
    }

    /// Run an automatic operator over the streamed deltas of its inputs.
    /// Registers the operator's own output delta in `deltas`. Returns false
    /// when none of its inputs were streamed and nothing ran.
    pub async fn execute_scoped(
        &self,
        conn: &mut SqliteConnection,
        scope: &RunScope,
        op: &OperatorNode,
        deltas: &mut Deltas,
    ) -> Result<bool> {
        if !op.inputs.iter().any(|var| deltas.contains_key(var)) {
            return Ok(false);
        }
        tracing::debug!("⚙️ Streaming through {} (statement {})", op.operator, op.statement);

        match &op.params {
            OperatorParams::WriteTable { file } => {
                let delta = streamed(deltas, single_input(op)?)?;
                let (headers, data) = rows::fetch_text(conn, &delta).await?;
                let path = scope.output(file);
                let header = !tokio::fs::try_exists(&path).await?;
                write_file(&path, &write_csv(&headers, &data, header), true).await?;
                tracing::debug!("📤 Appended {} streamed rows to {}", data.len(), file);
                return Ok(true);
            }
            OperatorParams::SampleRandom { size } => {
                let input_delta = streamed(deltas, single_input(op)?)?;
                let var = single_output(op)?;
                let output = scope.namespace.table(var);
                let output_delta = scope.namespace.delta_table(var);
                ensure_shaped_like(conn, &output, &input_delta).await?;
                let quota = (sample_limit(*size)? - rows::count(conn, &output).await?).max(0);

                rows::drop_table(conn, &output_delta).await?;
                let sql = format!(
                    "CREATE TABLE {} AS SELECT * FROM {} ORDER BY RANDOM() LIMIT {}",
                    quote_ident(&output_delta),
                    quote_ident(&input_delta),
                    quota
                );
                sqlx::query(&sql).execute(&mut *conn).await?;
                append(conn, &output, &output_delta).await?;
                deltas.insert(var.to_string(), output_delta);
            }
            OperatorParams::ExecSql { query } => {
                let var = single_output(op)?;
                let output = scope.namespace.table(var);
                let output_delta = scope.namespace.delta_table(var);
                let bindings: Vec<(String, String)> = op
                    .inputs
                    .iter()
                    .map(|v| {
                        let table = deltas.get(v).cloned().unwrap_or_else(|| scope.namespace.table(v));
                        (v.clone(), table)
                    })
                    .collect();
                rows::drop_table(conn, &output_delta).await?;
                exec_sql(conn, query, &bindings, &output_delta).await?;
                ensure_shaped_like(conn, &output, &output_delta).await?;
                append(conn, &output, &output_delta).await?;
                deltas.insert(var.to_string(), output_delta);
            }
            OperatorParams::ReadTable { .. } | OperatorParams::Label(_) => return Ok(false),
        }
        self.materialize(conn, scope, op).await?;
        Ok(true)
    }

    async fn materialize(&self, conn: &mut SqliteConnection, scope: &RunScope, op: &OperatorNode) -> Result<()> {
        if !self.materialize_outputs {
            return Ok(());
        }
        for var in &op.outputs {
            let (headers, data) = rows::fetch_text(conn, &scope.namespace.table(var)).await?;
            write_file(&scope.materialized(var), &write_csv(&headers, &data, true), false).await?;
        }
        Ok(())
    }
}

/// SQLite limits are signed 64-bit.
fn sample_limit(size: u64) -> Result<i64> {
    i64::try_from(size).map_err(|_| CymphonyError::Configuration(format!("sample size {} is too large", size)))
}

/// Evaluate `query` with each DSL variable visible as a temporary view over
/// its bound table, and store the result as `output`.
async fn exec_sql(
    conn: &mut SqliteConnection,
    query: &str,
    bindings: &[(String, String)],
    output: &str,
) -> Result<()> {
    for (var, table) in bindings {
        let view = format!("temp.{}", quote_ident(var));
        sqlx::query(&format!("DROP VIEW IF EXISTS {}", view))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!("CREATE TEMP VIEW {} AS SELECT * FROM main.{}", quote_ident(var), quote_ident(table)))
            .execute(&mut *conn)
            .await?;
    }

    let query = query.trim().trim_end_matches(';');
    let result = sqlx::query(&format!("CREATE TABLE main.{} AS {}", quote_ident(output), query))
        .execute(&mut *conn)
        .await;

    for (var, _) in bindings {
        sqlx::query(&format!("DROP VIEW IF EXISTS temp.{}", quote_ident(var)))
            .execute(&mut *conn)
            .await?;
    }

    result.map_err(|e| CymphonyError::Configuration(format!("exec_sql failed: {}", e)))?;
    Ok(())
}

/// Create `table` empty with the columns of `template` if it does not exist.
async fn ensure_shaped_like(conn: &mut SqliteConnection, table: &str, template: &str) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} AS SELECT * FROM {} WHERE 0",
        quote_ident(table),
        quote_ident(template)
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

async fn append(conn: &mut SqliteConnection, table: &str, delta: &str) -> Result<u64> {
    let sql = format!("INSERT INTO {} SELECT * FROM {}", quote_ident(table), quote_ident(delta));
    Ok(sqlx::query(&sql).execute(&mut *conn).await?.rows_affected())
}

async fn write_file(path: &Path, contents: &str, append: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if append {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
    } else {
        tokio::fs::write(path, contents).await?;
    }
    Ok(())
}

fn streamed(deltas: &Deltas, var: &str) -> Result<String> {
    deltas
        .get(var)
        .cloned()
        .ok_or_else(|| CymphonyError::CorruptState(format!("no streamed delta for {}", var)))
}

fn single_input(op: &OperatorNode) -> Result<&str> {
    op.inputs
        .first()
        .map(String::as_str)
        .ok_or_else(|| CymphonyError::CorruptState(format!("{} has no input", op.operator)))
}

fn single_output(op: &OperatorNode) -> Result<&str> {
    op.outputs
        .first()
        .map(String::as_str)
        .ok_or_else(|| CymphonyError::CorruptState(format!("{} has no output", op.operator)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Operator;
    use crate::config::Config;
    use crate::store::database::Database;

    fn op(operator: Operator, params: OperatorParams, inputs: &[&str], outputs: &[&str]) -> OperatorNode {
        OperatorNode {
            operator,
            params,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            statement: 1,
        }
    }

    async fn setup() -> (tempfile::TempDir, Database, RunScope) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&Config::for_data_dir(dir.path()).database)
            .await
            .unwrap();
        let scope = RunScope::new(RunNamespace::new(1, 1, 1, 1), dir.path());
        std::fs::create_dir_all(scope.run_dir.join("files")).unwrap();
        std::fs::write(scope.file("d.csv"), "_id,x\n1,a\n2,b\n3,a\n4,c\n").unwrap();
        (dir, db, scope)
    }

    #[tokio::test]
    async fn batch_pipeline_reads_filters_samples_and_writes() {
        let (_dir, db, scope) = setup().await;
        let exec = OperatorExecutor::new(true);
        let mut conn = db.connection().await.unwrap();

        let steps = [
            op(Operator::ReadTable, OperatorParams::ReadTable { file: "d.csv".into() }, &[], &["A"]),
            op(
                Operator::ExecSql,
                OperatorParams::ExecSql {
                    query: "SELECT * FROM A WHERE x = 'a'".into(),
                },
                &["A"],
                &["B"],
            ),
            op(Operator::SampleRandom, OperatorParams::SampleRandom { size: 1 }, &["B"], &["C"]),
            op(Operator::WriteTable, OperatorParams::WriteTable { file: "c.csv".into() }, &["C"], &[]),
        ];
        for step in &steps {
            exec.execute(&mut conn, &scope, step).await.unwrap();
        }

        assert_eq!(rows::count(&mut conn, &scope.namespace.table("B")).await.unwrap(), 2);
        let written = std::fs::read_to_string(scope.output("c.csv")).unwrap();
        assert!(written.starts_with("_id,x\n"));
        assert_eq!(written.lines().count(), 2);
        assert!(scope.materialized("B").exists());

        // temp views never leak onto the pooled connection
        let (views,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM temp.sqlite_master WHERE type = 'view'")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(views, 0);
    }

    #[tokio::test]
    async fn scoped_sampling_respects_the_remaining_quota() {
        let (_dir, db, scope) = setup().await;
        let exec = OperatorExecutor::new(false);
        let mut conn = db.connection().await.unwrap();
        let read = op(Operator::ReadTable, OperatorParams::ReadTable { file: "d.csv".into() }, &[], &["A"]);
        exec.execute(&mut conn, &scope, &read).await.unwrap();

        let sample = op(Operator::SampleRandom, OperatorParams::SampleRandom { size: 3 }, &["L"], &["S"]);
        let delta = scope.namespace.delta_table("L");
        let a = scope.namespace.table("A");

        for (tick, expected) in [(2, 2), (2, 3), (2, 3)] {
            rows::drop_table(&mut conn, &delta).await.unwrap();
            sqlx::query(&format!(
                "CREATE TABLE {} AS SELECT * FROM {} LIMIT {}",
                quote_ident(&delta),
                quote_ident(&a),
                tick
            ))
            .execute(&mut *conn)
            .await
            .unwrap();
            let mut deltas = Deltas::new();
            deltas.insert("L".into(), delta.clone());
            assert!(exec.execute_scoped(&mut conn, &scope, &sample, &mut deltas).await.unwrap());
            assert!(deltas.contains_key("S"));
            assert_eq!(
                rows::count(&mut conn, &scope.namespace.table("S")).await.unwrap(),
                expected
            );
        }

        let huge = op(Operator::SampleRandom, OperatorParams::SampleRandom { size: u64::MAX }, &["L"], &["H"]);
        let mut deltas = Deltas::new();
        deltas.insert("L".into(), delta.clone());
        let err = exec.execute_scoped(&mut conn, &scope, &huge, &mut deltas).await.unwrap_err();
        assert!(matches!(err, CymphonyError::Configuration(_)));
        let err = exec.execute(&mut conn, &scope, &huge).await.unwrap_err();
        assert!(matches!(err, CymphonyError::Configuration(_)));

        let unrelated = op(Operator::WriteTable, OperatorParams::WriteTable { file: "z.csv".into() }, &["Q"], &[]);
        let mut deltas = Deltas::new();
        assert!(!exec.execute_scoped(&mut conn, &scope, &unrelated, &mut deltas).await.unwrap());
    }
}
