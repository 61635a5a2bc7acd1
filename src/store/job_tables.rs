/// Job-scoped table lifecycle: create, populate, count, stream and archive
///
/// All functions take a connection so callers decide whether they run inside
/// a `LockedTx`. Creation and archival are idempotent: re-running them after a
/// crash inserts only what is missing.

use super::naming::{quote_ident, JobTables};
use crate::error::Result;
use sqlx::SqliteConnection;

/// Create the local-protocol tables for a human job and load one task per input row.
/// Returns the number of tasks.
pub async fn create_local(conn: &mut SqliteConnection, tables: &JobTables, input: &str) -> Result<i64> {
    copy_tuples(conn, tables, input).await?;

    let tasks = quote_ident(&tables.tasks);
    let assignments = quote_ident(&tables.assignments);
    let ddl = [
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY,
                total_assigned INTEGER NOT NULL DEFAULT 0,
                abandoned INTEGER NOT NULL DEFAULT 0,
                pending_annotations INTEGER NOT NULL DEFAULT 0,
                done INTEGER NOT NULL DEFAULT 0
            )",
            tasks
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                worker_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                timeout_threshold_at INTEGER NOT NULL
            )",
            assignments
        ),
        outputs_ddl(&tables.outputs, "INTEGER"),
        final_labels_ddl(&tables.final_labels),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (task_id, worker_id, status)",
            quote_ident(&tables.index("assignments_task_worker")),
            assignments
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (status, timeout_threshold_at)",
            quote_ident(&tables.index("assignments_timeout")),
            assignments
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (done)",
            quote_ident(&tables.index("tasks_done")),
            tasks
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (task_id, worker_id)",
            quote_ident(&tables.index("outputs_task_worker")),
            quote_ident(&tables.outputs)
        ),
    ];
    for sql in &ddl {
        sqlx::query(sql).execute(&mut *conn).await?;
    }

    populate_tasks(conn, tables).await
}

/// Create the provider-protocol (`amt_`) tables. Returns the number of tasks.
pub async fn create_provider(conn: &mut SqliteConnection, tables: &JobTables, input: &str) -> Result<i64> {
    copy_tuples(conn, tables, input).await?;

    let ddl = [
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY,
                hit_id TEXT
            )",
            quote_ident(&tables.tasks)
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                worker_id TEXT NOT NULL,
                annotation TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (task_id, worker_id)
            )",
            quote_ident(&tables.outputs)
        ),
        final_labels_ddl(&tables.final_labels),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                hit_id TEXT PRIMARY KEY,
                task_ids JSON NOT NULL,
                created_at INTEGER NOT NULL
            )",
            quote_ident(&tables.hits)
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (task_id, created_at)",
            quote_ident(&tables.index("outputs_task")),
            quote_ident(&tables.outputs)
        ),
    ];
    for sql in &ddl {
        sqlx::query(sql).execute(&mut *conn).await?;
    }

    populate_tasks(conn, tables).await
}

fn outputs_ddl(table: &str, worker_type: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL,
            worker_id {} NOT NULL,
            annotation TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        quote_ident(table),
        worker_type
    )
}

fn final_labels_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            task_id INTEGER PRIMARY KEY,
            label TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        quote_ident(table)
    )
}

async fn copy_tuples(conn: &mut SqliteConnection, tables: &JobTables, input: &str) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} AS SELECT * FROM {}",
        quote_ident(&tables.tuples),
        quote_ident(input)
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    let sql = format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (_id)",
        quote_ident(&tables.index("tuples_id")),
        quote_ident(&tables.tuples)
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

async fn populate_tasks(conn: &mut SqliteConnection, tables: &JobTables) -> Result<i64> {
    let sql = format!(
        "INSERT OR IGNORE INTO {} (id) SELECT _id FROM {}",
        quote_ident(&tables.tasks),
        quote_ident(&tables.tuples)
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    let (tasks, _) = counts(conn, tables).await?;
    tracing::debug!(table = %tables.tasks, tasks, "job tasks populated");
    Ok(tasks)
}

/// (task count, final label count)
pub async fn counts(conn: &mut SqliteConnection, tables: &JobTables) -> Result<(i64, i64)> {
    let sql = format!(
        "SELECT (SELECT COUNT(*) FROM {}), (SELECT COUNT(*) FROM {})",
        quote_ident(&tables.tasks),
        quote_ident(&tables.final_labels)
    );
    let row: (i64, i64) = sqlx::query_as(&sql).fetch_one(&mut *conn).await?;
    Ok(row)
}

pub async fn is_closed(conn: &mut SqliteConnection, tables: &JobTables) -> Result<bool> {
    let (tasks, labels) = counts(conn, tables).await?;
    Ok(tasks == labels)
}

/// Create `target` with the labeled-row shape (`tuples.*, label`) if missing.
async fn ensure_labeled_table(conn: &mut SqliteConnection, tables: &JobTables, target: &str) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} AS
         SELECT t.*, f.label AS label FROM {} t JOIN {} f ON t._id = f.task_id WHERE 0",
        quote_ident(target),
        quote_ident(&tables.tuples),
        quote_ident(&tables.final_labels)
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// Copy finalized rows not yet present in `target`. Returns rows copied.
pub async fn archive_labels(conn: &mut SqliteConnection, tables: &JobTables, target: &str) -> Result<u64> {
    ensure_labeled_table(conn, tables, target).await?;
    let sql = format!(
        "INSERT INTO {target}
         SELECT t.*, f.label FROM {tuples} t JOIN {labels} f ON t._id = f.task_id
         WHERE t._id NOT IN (SELECT _id FROM {target})
         ORDER BY t._id",
        target = quote_ident(target),
        tuples = quote_ident(&tables.tuples),
        labels = quote_ident(&tables.final_labels),
    );
    let done = sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(done.rows_affected())
}

/// Copy votes not yet present in `target`. Returns rows copied.
pub async fn archive_votes(conn: &mut SqliteConnection, tables: &JobTables, target: &str) -> Result<u64> {
    let create = format!(
        "CREATE TABLE IF NOT EXISTS {} AS
         SELECT id, task_id, worker_id, annotation, created_at FROM {} WHERE 0",
        quote_ident(target),
        quote_ident(&tables.outputs)
    );
    sqlx::query(&create).execute(&mut *conn).await?;
    let sql = format!(
        "INSERT INTO {target}
         SELECT id, task_id, worker_id, annotation, created_at FROM {outputs}
         WHERE id NOT IN (SELECT id FROM {target})
         ORDER BY id",
        target = quote_ident(target),
        outputs = quote_ident(&tables.outputs),
    );
    let done = sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(done.rows_affected())
}

/// Append newly finalized rows to the run table and expose exactly those rows
/// as `delta`, replacing any previous delta. Returns the number of new rows.
pub async fn stream_new_labels(
    conn: &mut SqliteConnection,
    tables: &JobTables,
    target: &str,
    delta: &str,
) -> Result<u64> {
    ensure_labeled_table(conn, tables, target).await?;
    let drop = format!("DROP TABLE IF EXISTS {}", quote_ident(delta));
    sqlx::query(&drop).execute(&mut *conn).await?;
    let sql = format!(
        "CREATE TABLE {delta} AS
         SELECT t.*, f.label AS label FROM {tuples} t JOIN {labels} f ON t._id = f.task_id
         WHERE t._id NOT IN (SELECT _id FROM {target})
         ORDER BY t._id",
        delta = quote_ident(delta),
        tuples = quote_ident(&tables.tuples),
        labels = quote_ident(&tables.final_labels),
        target = quote_ident(target),
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    let sql = format!(
        "INSERT INTO {} SELECT * FROM {}",
        quote_ident(target),
        quote_ident(delta)
    );
    let done = sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(done.rows_affected())
}

/// Drop every index belonging to the job.
pub async fn drop_indexes(conn: &mut SqliteConnection, tables: &JobTables) -> Result<()> {
    let names: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND substr(name, 1, length(?1)) = ?1",
    )
    .bind(&tables.index_prefix)
    .fetch_all(&mut *conn)
    .await?;
    for (name,) in names {
        let sql = format!("DROP INDEX IF EXISTS {}", quote_ident(&name));
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::database::Database;
    use crate::store::naming::RunNamespace;

    async fn setup() -> (tempfile::TempDir, Database, JobTables) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&Config::for_data_dir(dir.path()).database)
            .await
            .unwrap();
        let tables = RunNamespace::new(1, 1, 1, 1).job(1).local();
        let mut conn = db.connection().await.unwrap();
        sqlx::query("CREATE TABLE src (_id INTEGER, text TEXT)")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO src VALUES (10, 'a'), (20, 'b'), (30, 'c')")
            .execute(&mut *conn)
            .await
            .unwrap();
        (dir, db, tables)
    }

    #[tokio::test]
    async fn creation_is_idempotent() {
        let (_dir, db, tables) = setup().await;
        let mut conn = db.connection().await.unwrap();
        assert_eq!(create_local(&mut conn, &tables, "src").await.unwrap(), 3);
        assert_eq!(create_local(&mut conn, &tables, "src").await.unwrap(), 3);
        assert_eq!(counts(&mut conn, &tables).await.unwrap(), (3, 0));
        assert!(!is_closed(&mut conn, &tables).await.unwrap());
    }

    #[tokio::test]
    async fn archive_copies_each_row_once_and_indexes_drop() {
        let (_dir, db, tables) = setup().await;
        let mut conn = db.connection().await.unwrap();
        create_local(&mut conn, &tables, "src").await.unwrap();
        let sql = format!(
            "INSERT INTO {} (task_id, label, created_at) VALUES (10, 'Yes', 0), (20, 'No', 0)",
            quote_ident(&tables.final_labels)
        );
        sqlx::query(&sql).execute(&mut *conn).await.unwrap();

        assert_eq!(archive_labels(&mut conn, &tables, "out").await.unwrap(), 2);
        assert_eq!(archive_labels(&mut conn, &tables, "out").await.unwrap(), 0);
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT _id, text, label FROM out ORDER BY _id")
                .fetch_all(&mut *conn)
                .await
                .unwrap();
        assert_eq!(rows[1], (20, "b".to_string(), "No".to_string()));

        drop_indexes(&mut conn, &tables).await.unwrap();
        let (left,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'u1_p1_w1_r1_j1_idx%'",
        )
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn streaming_exposes_only_new_rows() {
        let (_dir, db, tables) = setup().await;
        let mut conn = db.connection().await.unwrap();
        create_local(&mut conn, &tables, "src").await.unwrap();
        let insert = |id: i64| {
            format!(
                "INSERT INTO {} (task_id, label, created_at) VALUES ({}, 'Yes', 0)",
                quote_ident(&tables.final_labels),
                id
            )
        };
        sqlx::query(&insert(10)).execute(&mut *conn).await.unwrap();
        assert_eq!(stream_new_labels(&mut conn, &tables, "out", "delta").await.unwrap(), 1);
        sqlx::query(&insert(30)).execute(&mut *conn).await.unwrap();
        assert_eq!(stream_new_labels(&mut conn, &tables, "out", "delta").await.unwrap(), 1);
        let (delta_id,): (i64,) = sqlx::query_as("SELECT _id FROM delta")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(delta_id, 30);
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM out")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(stream_new_labels(&mut conn, &tables, "out", "delta").await.unwrap(), 0);
    }
}
