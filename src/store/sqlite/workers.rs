use super::{encode_ts, get_enum, get_json, get_ts, SqliteStore};
use crate::error::{Error, Result};
use crate::store::WorkerStore;
use crate::worker::{Worker, WorkerStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const WORKER_COLUMNS: &str =
    "id, hostname, pid, status, current_task_id, stats, last_heartbeat, created_at, updated_at";

fn map_worker(row: &SqliteRow) -> Result<Worker> {
    let pid: i64 = row.try_get("pid")?;
    Ok(Worker {
        id: row.try_get("id")?,
        hostname: row.try_get("hostname")?,
        pid: u32::try_from(pid).map_err(|_| Error::corrupt("worker", format!("invalid pid {}", pid)))?,
        status: get_enum(row, "worker", "status")?,
        current_task_id: row.try_get("current_task_id")?,
        stats: get_json(row, "stats")?,
        last_heartbeat: get_ts(row, "worker", "last_heartbeat")?,
        created_at: get_ts(row, "worker", "created_at")?,
        updated_at: get_ts(row, "worker", "updated_at")?,
    })
}

#[async_trait]
impl WorkerStore for SqliteStore {
    async fn insert_worker(&self, worker: &Worker) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, hostname, pid, status, current_task_id, stats, last_heartbeat, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.hostname)
        .bind(i64::from(worker.pid))
        .bind(worker.status.as_str())
        .bind(worker.current_task_id.as_deref())
        .bind(serde_json::to_string(&worker.stats)?)
        .bind(encode_ts(&worker.last_heartbeat))
        .bind(encode_ts(&worker.created_at))
        .bind(encode_ts(&worker.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>> {
        let row = sqlx::query(&format!("SELECT {} FROM workers WHERE id = $1", WORKER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(map_worker).transpose()
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workers ORDER BY created_at ASC",
            WORKER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_worker).collect()
    }

    async fn heartbeat(
        &self,
        id: &str,
        stats: &Value,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerStatus>> {
        let row = sqlx::query(
            r#"
            UPDATE workers SET last_heartbeat = $1, updated_at = $1, stats = $2
            WHERE id = $3
            RETURNING status
            "#,
        )
        .bind(encode_ts(&now))
        .bind(serde_json::to_string(stats)?)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(|r| get_enum(r, "worker", "status")).transpose()
    }

    async fn set_worker_status(&self, id: &str, status: WorkerStatus, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE workers SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(encode_ts(&now))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_current_task(&self, id: &str, task_id: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE workers SET current_task_id = $1, updated_at = $2 WHERE id = $3")
            .bind(task_id)
            .bind(encode_ts(&now))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Worker>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workers WHERE last_heartbeat < $1 ORDER BY last_heartbeat ASC",
            WORKER_COLUMNS
        ))
        .bind(encode_ts(&cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_worker).collect()
    }

    async fn delete_worker(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
