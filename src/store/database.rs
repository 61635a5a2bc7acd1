/// SQLite store: connection pool, catalog schema and the write lock
///
/// One database file holds the catalog (workflows, runs, jobs, graph rows,
/// workers) and every run- and job-scoped data table. Runs in WAL mode so
/// readers never block; writers that need mutual exclusion open a `LockedTx`.

use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the store described by `config` and make sure
    /// the catalog schema exists.
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        let path = Path::new(&config.data_dir).join(&config.file_name);
        std::fs::create_dir_all(&config.data_dir)?;

        tracing::info!("🗄️ Opening catalog database: {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Take the store's write lock (`BEGIN IMMEDIATE`) on a dedicated connection.
    pub async fn lock(&self) -> Result<LockedTx> {
        LockedTx::begin(&self.pool).await
    }

    /// Plain connection for multi-statement work that needs connection-local
    /// state (temporary views) but not the write lock.
    pub async fn connection(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Create catalog tables. Safe to call repeatedly.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                artifacts JSON NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id INTEGER NOT NULL REFERENCES workflows(id),
                project_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                run_type TEXT NOT NULL,
                notification_url TEXT,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                run_id INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                definition JSON NOT NULL,
                PRIMARY KEY (run_id, node_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS edges (
                run_id INTEGER NOT NULL,
                origin INTEGER NOT NULL,
                destination INTEGER NOT NULL,
                PRIMARY KEY (run_id, origin, destination)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS schedule (
                run_id INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (run_id, position)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id),
                workflow_id INTEGER NOT NULL,
                project_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                operator TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                params JSON NOT NULL,
                created_at INTEGER NOT NULL,
                completed_at INTEGER,
                UNIQUE (run_id, node_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_runs_workflow ON runs(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, kind)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// An open `BEGIN IMMEDIATE` transaction holding the store's reserved lock.
///
/// Must end in `commit` or `rollback`. If dropped while still open (early
/// return, cancelled future) the connection is closed instead of being returned
/// to the pool mid-transaction, which releases the lock.
pub struct LockedTx {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl LockedTx {
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn, open: true })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub async fn commit(mut self) -> Result<()> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }
}

impl Drop for LockedTx {
    fn drop(&mut self) {
        if self.open {
            tracing::warn!("locked transaction dropped without commit, closing connection");
            self.conn.close_on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn schema_is_idempotent_and_lock_serializes_writers() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(dir.path());
        let db = Database::open(&config.database).await.unwrap();
        // second open runs init_schema again on the same file
        let db2 = Database::open(&config.database).await.unwrap();

        let mut tx = db.lock().await.unwrap();
        sqlx::query("INSERT INTO workers (id, kind) VALUES (1, 'REGULAR')")
            .execute(tx.conn())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let tx = db2.lock().await.unwrap();
        tx.rollback().await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workers")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn dropped_lock_releases_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(dir.path());
        let db = Database::open(&config.database).await.unwrap();
        {
            let mut tx = db.lock().await.unwrap();
            sqlx::query("INSERT INTO workers (id, kind) VALUES (9, 'STEWARD')")
                .execute(tx.conn())
                .await
                .unwrap();
        }
        let tx = db.lock().await.unwrap();
        tx.commit().await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workers")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
