use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use log::{debug, error, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Number, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::models::conversation::ResultRow;
use crate::models::query::QueryResultSet;
use crate::services::error::GatewayError;

/// Most rows a single query may return
pub const ROW_CAP: usize = 100;

static LIMIT_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLIMIT\s+\d+").expect("valid regex"));

/// Read side of the analytics store
#[async_trait]
pub trait ReadOnlyDatabase: Send + Sync + 'static {
    /// Run a query and return at most `max_rows` rows, plus whether more were available
    async fn fetch_rows(&self, sql: &str, max_rows: usize) -> Result<(Vec<ResultRow>, bool)>;
}

/// SQLite pool opened read-only, separate from any connection that writes the store
#[derive(Clone, Debug)]
pub struct SqliteReadOnlyDatabase {
    pool: SqlitePool,
}

impl SqliteReadOnlyDatabase {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid analytics database URL '{}'", database_url))?
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to open analytics database read-only")?;
        info!("Analytics database opened read-only ({} connections)", max_connections);
        Ok(Self { pool })
    }
}

#[async_trait]
impl ReadOnlyDatabase for SqliteReadOnlyDatabase {
    async fn fetch_rows(&self, sql: &str, max_rows: usize) -> Result<(Vec<ResultRow>, bool)> {
        // one extra row tells us whether the cap cut anything off
        let rows: Vec<SqliteRow> = sqlx::query(sql)
            .fetch(&self.pool)
            .take(max_rows + 1)
            .try_collect()
            .await?;

        let truncated = rows.len() > max_rows;
        let rows = rows.iter().take(max_rows).map(row_to_json).collect::<Result<Vec<_>>>()?;
        Ok((rows, truncated))
    }
}

fn row_to_json(row: &SqliteRow) -> Result<ResultRow> {
    let mut map = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "INT8" | "BIGINT" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
                "BOOLEAN" => Value::from(row.try_get_unchecked::<bool, _>(index)?),
                "REAL" | "NUMERIC" => Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
                    Value::String(format!("<blob {} bytes>", bytes.len()))
                }
                _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
            }
        };
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

/// Runs accepted queries with the row cap applied
#[derive(Clone, Debug)]
pub struct QueryExecutor<D: ReadOnlyDatabase> {
    database: D,
}

impl<D: ReadOnlyDatabase> QueryExecutor<D> {
    pub fn new(database: D) -> Self {
        Self { database }
    }

    /// Append `LIMIT 100` unless the query already carries a limit
    pub fn apply_row_cap(sql: &str) -> String {
        let sql = sql.trim().trim_end_matches(';').trim_end();
        if LIMIT_CLAUSE.is_match(sql) {
            sql.to_string()
        } else {
            format!("{} LIMIT {}", sql, ROW_CAP)
        }
    }

    pub async fn execute(&self, sql: &str) -> Result<QueryResultSet, GatewayError> {
        let capped = Self::apply_row_cap(sql);
        debug!("Executing analytics query: {}", capped);

        match self.database.fetch_rows(&capped, ROW_CAP).await {
            Ok((rows, truncated)) => {
                info!("Query returned {} rows{}", rows.len(), if truncated { " (truncated)" } else { "" });
                Ok(QueryResultSet::new(rows, truncated))
            }
            Err(e) => {
                error!("Analytics query failed: {:#}", e);
                Err(GatewayError::QueryExecution(e.to_string()))
            }
        }
    }
}

/// On-disk analytics store with a few workflows, for tests across the crate
#[cfg(test)]
pub(crate) async fn seeded_analytics_db(dir: &std::path::Path) -> SqliteReadOnlyDatabase {
    let path = dir.join("analytics.db");
    let writer = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(&path).create_if_missing(true))
        .await
        .unwrap();

    for statement in [
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, email TEXT, status TEXT)",
        "CREATE TABLE workflows (id INTEGER PRIMARY KEY, name TEXT, status TEXT, customer_id INTEGER, task_count INTEGER, score REAL, payload BLOB)",
        "CREATE TABLE tasks (id INTEGER PRIMARY KEY, workflow_id INTEGER, name TEXT, position INTEGER)",
        "CREATE TABLE users (id INTEGER PRIMARY KEY, password_hash TEXT)",
        "INSERT INTO customers (id, name, email, status) VALUES (1, 'Acme', 'ops@acme.test', 'active')",
        "INSERT INTO workflows (id, name, status, customer_id, task_count, score, payload) VALUES (1, 'Onboarding', 'active', 1, 3, 4.5, x'00ff'), (2, 'Dunning', 'inactive', 1, 2, NULL, NULL), (3, 'Renewal', 'active', 1, 0, 1.0, NULL)",
        "INSERT INTO users (id, password_hash) VALUES (1, 'secret')",
    ] {
        sqlx::query(statement).execute(&writer).await.unwrap();
    }
    for i in 0..150 {
        sqlx::query("INSERT INTO tasks (workflow_id, name, position) VALUES (1, ?, ?)")
            .bind(format!("step {}", i))
            .bind(i)
            .execute(&writer)
            .await
            .unwrap();
    }
    writer.close().await;

    SqliteReadOnlyDatabase::connect(&format!("sqlite://{}", path.display()), 2)
        .await
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn limit_is_appended_only_when_missing() {
        type Exec = QueryExecutor<SqliteReadOnlyDatabase>;
        assert_eq!(Exec::apply_row_cap("SELECT * FROM workflows;"), "SELECT * FROM workflows LIMIT 100");
        assert_eq!(Exec::apply_row_cap("SELECT * FROM workflows limit 5"), "SELECT * FROM workflows limit 5");
        assert_eq!(
            Exec::apply_row_cap("SELECT * FROM workflows LIMIT 10 OFFSET 20"),
            "SELECT * FROM workflows LIMIT 10 OFFSET 20"
        );
    }

    #[tokio::test]
    async fn count_query_returns_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let executor = QueryExecutor::new(seeded_analytics_db(dir.path()).await);

        let result = executor
            .execute("SELECT COUNT(*) AS total_workflows FROM workflows")
            .await
            .unwrap();
        assert_eq!(result.count, 1);
        assert!(!result.truncated);
        assert_eq!(result.rows[0].get("total_workflows"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn scalar_types_map_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let executor = QueryExecutor::new(seeded_analytics_db(dir.path()).await);

        let result = executor
            .execute("SELECT id, name, score, payload FROM workflows ORDER BY id")
            .await
            .unwrap();
        assert_eq!(result.rows[0].get("name"), Some(&json!("Onboarding")));
        assert_eq!(result.rows[0].get("score"), Some(&json!(4.5)));
        assert_eq!(result.rows[0].get("payload"), Some(&json!("<blob 2 bytes>")));
        assert_eq!(result.rows[1].get("score"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn row_cap_applies_and_explicit_limit_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = QueryExecutor::new(seeded_analytics_db(dir.path()).await);

        let capped = executor.execute("SELECT * FROM tasks").await.unwrap();
        assert_eq!(capped.count, ROW_CAP);

        let limited = executor.execute("SELECT * FROM tasks LIMIT 5").await.unwrap();
        assert_eq!(limited.count, 5);
        assert!(!limited.truncated);

        let oversized = executor.execute("SELECT * FROM tasks LIMIT 500").await.unwrap();
        assert_eq!(oversized.count, ROW_CAP);
        assert!(oversized.truncated);
    }

    #[tokio::test]
    async fn driver_errors_become_execution_errors() {
        let dir = tempfile::tempdir().unwrap();
        let executor = QueryExecutor::new(seeded_analytics_db(dir.path()).await);

        let err = executor.execute("SELECT nope FROM workflows").await.unwrap_err();
        assert!(matches!(err, GatewayError::QueryExecution(_)));
    }

    #[tokio::test]
    async fn connection_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let database = seeded_analytics_db(dir.path()).await;

        let write = database.fetch_rows("DELETE FROM workflows", ROW_CAP).await;
        assert!(write.is_err());

        let (rows, _) = database.fetch_rows("SELECT COUNT(*) AS n FROM workflows", ROW_CAP).await.unwrap();
        assert_eq!(rows[0].get("n"), Some(&json!(3)));
    }
}
