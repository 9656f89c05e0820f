/// SQLite persistence layer
///
/// One connection pool backs every store contract. Timestamps are written as
/// fixed-width UTC RFC 3339 text (nanosecond precision, `Z` suffix) so that
/// SQL string comparison orders them like instants.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

mod schedules;
mod tasks;
mod workers;
mod workflows;

/// SQLite-backed implementation of all store traits
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool (schema is not touched)
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a database file and initialize the schema
    ///
    /// WAL mode plus a busy timeout lets several worker processes share the file.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| Error::Config {
                message: format!("failed to create data directory '{}': {}", dir.display(), e),
            })?;
        }

        tracing::info!("🗄️ Opening scheduler database: {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database on a single, never-recycled connection
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes; safe to call repeatedly
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                input_component TEXT,
                output_component TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                expression TEXT NOT NULL,
                params TEXT NOT NULL,
                status TEXT NOT NULL,
                next_run_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                schedule_id TEXT,
                status TEXT NOT NULL,
                input_data TEXT NOT NULL,
                output_data TEXT,
                error TEXT,
                tries INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                next_retry_at TEXT,
                worker_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_logs (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                pid INTEGER NOT NULL,
                status TEXT NOT NULL,
                current_task_id TEXT,
                stats TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(status, next_run_at)",
            "CREATE INDEX IF NOT EXISTS idx_schedules_workflow ON schedules(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(status, next_retry_at)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks(workflow_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(worker_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id, created_at)",
            // Single-flight guard enforced by the store itself
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_single_flight ON tasks(workflow_id) \
             WHERE schedule_id IS NOT NULL AND status IN ('pending', 'running')",
        ];
        for ddl in indexes {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        Ok(())
    }
}

/// Format an instant for TEXT storage
pub(crate) fn encode_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_ts(entity: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::corrupt(entity, format!("invalid timestamp '{}': {}", raw, e)))
}

pub(crate) fn get_ts(row: &SqliteRow, entity: &str, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    decode_ts(entity, &raw)
}

pub(crate) fn get_opt_ts(row: &SqliteRow, entity: &str, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|r| decode_ts(entity, &r)).transpose()
}

pub(crate) fn get_json(row: &SqliteRow, column: &str) -> Result<serde_json::Value> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}

pub(crate) fn get_enum<T: std::str::FromStr<Err = String>>(
    row: &SqliteRow,
    entity: &str,
    column: &str,
) -> Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: String| Error::corrupt(entity, e))
}

pub(crate) fn is_unique_violation(err: &Error) -> bool {
    matches!(err, Error::Store(sqlx::Error::Database(db)) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encoded_timestamps_sort_like_instants() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 9, 59, 59).unwrap();
        let b = a + chrono::Duration::nanoseconds(1);
        let c = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert!(encode_ts(&a) < encode_ts(&b));
        assert!(encode_ts(&b) < encode_ts(&c));
        assert_eq!(decode_ts("test", &encode_ts(&b)).unwrap(), b);
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.init_schema().await.unwrap();
    }
}
