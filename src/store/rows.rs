/// Text-typed access to run tables whose columns are only known at runtime
///
/// Loaded tables carry an INTEGER `_id` and TEXT columns. Reads cast every
/// column to TEXT so rows can be exported or shipped to the provider without
/// knowing their shape.

use super::naming::quote_ident;
use crate::error::Result;
use crate::tabular::Table;
use sqlx::{Connection, Row, SqliteConnection};

/// Column names of `table` in declaration order. Empty when the table is missing.
pub async fn columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

pub async fn exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let (found,): (i64,) =
        sqlx::query_as("SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)")
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
    Ok(found != 0)
}

pub async fn count(conn: &mut SqliteConnection, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    let (n,): (i64,) = sqlx::query_as(&sql).fetch_one(&mut *conn).await?;
    Ok(n)
}

pub async fn drop_table(conn: &mut SqliteConnection, table: &str) -> Result<()> {
    let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// Every row of `table` as text, ordered by `_id` when the column exists.
pub async fn fetch_text(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<(Vec<String>, Vec<Vec<Option<String>>>)> {
    let headers = columns(conn, table).await?;
    if headers.is_empty() {
        return Ok((headers, Vec::new()));
    }
    let select: Vec<String> = headers
        .iter()
        .map(|h| format!("CAST({} AS TEXT)", quote_ident(h)))
        .collect();
    let order = if headers.iter().any(|h| h == "_id") {
        " ORDER BY \"_id\""
    } else {
        ""
    };
    let sql = format!("SELECT {} FROM {}{}", select.join(", "), quote_ident(table), order);
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut cells = Vec::with_capacity(headers.len());
        for i in 0..headers.len() {
            cells.push(row.try_get::<Option<String>, _>(i)?);
        }
        out.push(cells);
    }
    Ok((headers, out))
}

/// Create `table` from parsed CSV: `_id INTEGER`, every other column TEXT.
/// Any previous table with that name is replaced. The load is one
/// transaction; on failure the previous table is left as it was.
pub async fn create_from_csv(conn: &mut SqliteConnection, table: &str, data: &Table) -> Result<u64> {
    let mut tx = conn.begin().await?;
    drop_table(&mut *tx, table).await?;

    let columns: Vec<String> = data
        .headers
        .iter()
        .map(|h| {
            if h == "_id" {
                format!("{} INTEGER", quote_ident(h))
            } else {
                format!("{} TEXT", quote_ident(h))
            }
        })
        .collect();
    let ddl = format!("CREATE TABLE {} ({})", quote_ident(table), columns.join(", "));
    sqlx::query(&ddl).execute(&mut *tx).await?;

    let placeholders = vec!["?"; data.headers.len()].join(", ");
    let insert = format!("INSERT INTO {} VALUES ({})", quote_ident(table), placeholders);
    let id_column = data.headers.iter().position(|h| h == "_id");

    let mut inserted = 0;
    for row in &data.rows {
        let mut query = sqlx::query(&insert);
        for (i, cell) in row.iter().enumerate() {
            query = if Some(i) == id_column {
                // validated at compile time; a non-integer here binds as text
                match cell.trim().parse::<i64>() {
                    Ok(id) => query.bind(id),
                    Err(_) => query.bind(cell.clone()),
                }
            } else {
                query.bind(cell.clone())
            };
        }
        inserted += query.execute(&mut *tx).await?.rows_affected();
    }
    tx.commit().await?;
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::database::Database;
    use crate::tabular::parse_csv;

    #[tokio::test]
    async fn csv_round_trips_through_a_table() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&Config::for_data_dir(dir.path()).database)
            .await
            .unwrap();
        let mut conn = db.connection().await.unwrap();

        let data = parse_csv("_id,text\n2,b\n1,\"a, with comma\"\n").unwrap();
        assert_eq!(create_from_csv(&mut conn, "t", &data).await.unwrap(), 2);
        assert!(exists(&mut conn, "t").await.unwrap());
        assert_eq!(count(&mut conn, "t").await.unwrap(), 2);

        let (headers, rows) = fetch_text(&mut conn, "t").await.unwrap();
        assert_eq!(headers, vec!["_id", "text"]);
        assert_eq!(rows[0], vec![Some("1".into()), Some("a, with comma".into())]);

        let (kind,): (String,) = sqlx::query_as("SELECT typeof(_id) FROM t LIMIT 1")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(kind, "integer");

        drop_table(&mut conn, "t").await.unwrap();
        assert!(!exists(&mut conn, "t").await.unwrap());
        assert!(columns(&mut conn, "t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_failed_load_keeps_the_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&Config::for_data_dir(dir.path()).database)
            .await
            .unwrap();
        let mut conn = db.connection().await.unwrap();

        let good = parse_csv("_id,text\n1,a\n2,b\n").unwrap();
        create_from_csv(&mut conn, "t", &good).await.unwrap();

        // duplicate column: CREATE TABLE fails after the old table was dropped
        let broken = Table {
            headers: vec!["_id".into(), "text".into(), "text".into()],
            rows: vec![vec!["1".into(), "x".into(), "y".into()]],
        };
        assert!(create_from_csv(&mut conn, "t", &broken).await.is_err());

        let (_, rows) = fetch_text(&mut conn, "t").await.unwrap();
        assert_eq!(rows, vec![
            vec![Some("1".into()), Some("a".into())],
            vec![Some("2".into()), Some("b".into())],
        ]);
    }
}
