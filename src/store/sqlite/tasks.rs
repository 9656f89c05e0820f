use super::{encode_ts, get_enum, get_json, get_opt_ts, get_ts, is_unique_violation, SqliteStore};
use crate::error::{Error, Result};
use crate::store::{ClaimOutcome, TaskGuard, TaskStore};
use crate::task::{LogLevel, Task, TaskFilter, TaskLog, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

const TASK_COLUMNS: &str = "id, workflow_id, schedule_id, status, input_data, output_data, error, \
     tries, max_retries, next_retry_at, worker_id, created_at, updated_at, started_at, finished_at";

fn get_count(row: &SqliteRow, column: &str) -> Result<u32> {
    let raw: i64 = row.try_get(column)?;
    u32::try_from(raw).map_err(|_| Error::corrupt("task", format!("{} out of range: {}", column, raw)))
}

fn map_task(row: &SqliteRow) -> Result<Task> {
    let output: Option<String> = row.try_get("output_data")?;
    Ok(Task {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        schedule_id: row.try_get("schedule_id")?,
        status: get_enum(row, "task", "status")?,
        input_data: get_json(row, "input_data")?,
        output_data: output.map(|o| serde_json::from_str(&o)).transpose()?,
        error: row.try_get("error")?,
        tries: get_count(row, "tries")?,
        max_retries: get_count(row, "max_retries")?,
        next_retry_at: get_opt_ts(row, "task", "next_retry_at")?,
        worker_id: row.try_get("worker_id")?,
        created_at: get_ts(row, "task", "created_at")?,
        updated_at: get_ts(row, "task", "updated_at")?,
        started_at: get_opt_ts(row, "task", "started_at")?,
        finished_at: get_opt_ts(row, "task", "finished_at")?,
    })
}

fn map_log(row: &SqliteRow) -> Result<TaskLog> {
    Ok(TaskLog {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        level: get_enum(row, "task_log", "level")?,
        message: row.try_get("message")?,
        created_at: get_ts(row, "task_log", "created_at")?,
    })
}

/// Insert on an already-acquired connection (used inside transactions)
///
/// With `single_flight` the row is written only when the workflow has no
/// pending or running task. Returns whether a row was written.
pub(super) async fn insert_task_on(
    conn: &mut SqliteConnection,
    task: &Task,
    single_flight: bool,
) -> Result<bool> {
    let output = task.output_data.as_ref().map(serde_json::to_string).transpose()?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO tasks (id, workflow_id, schedule_id, status, input_data, output_data, error,
                           tries, max_retries, next_retry_at, worker_id, created_at, updated_at,
                           started_at, finished_at)
        SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
        WHERE $16 = 0 OR NOT EXISTS (
            SELECT 1 FROM tasks WHERE workflow_id = $2 AND status IN ('pending', 'running')
        )
        "#,
    )
    .bind(&task.id)
    .bind(&task.workflow_id)
    .bind(task.schedule_id.as_deref())
    .bind(task.status.as_str())
    .bind(serde_json::to_string(&task.input_data)?)
    .bind(output)
    .bind(task.error.as_deref())
    .bind(i64::from(task.tries))
    .bind(i64::from(task.max_retries))
    .bind(task.next_retry_at.as_ref().map(encode_ts))
    .bind(task.worker_id.as_deref())
    .bind(encode_ts(&task.created_at))
    .bind(encode_ts(&task.updated_at))
    .bind(task.started_at.as_ref().map(encode_ts))
    .bind(task.finished_at.as_ref().map(encode_ts))
    .bind(single_flight)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(inserted > 0)
}

/// Overwrite the mutable columns, optionally only while `guard` holds.
/// Returns the number of rows changed.
async fn update_task_on(
    conn: &mut SqliteConnection,
    task: &Task,
    guard: Option<TaskGuard<'_>>,
) -> Result<u64> {
    let output = task.output_data.as_ref().map(serde_json::to_string).transpose()?;
    let (expected, check_owner, owner) = match guard {
        None => (None, false, None),
        Some(TaskGuard::Pending) => (Some(TaskStatus::Pending), false, None),
        Some(TaskGuard::Running { owner }) => (Some(TaskStatus::Running), true, owner),
        Some(TaskGuard::Failed) => (Some(TaskStatus::Failed), false, None),
    };

    let updated = sqlx::query(
        r#"
        UPDATE tasks SET
            status = $1,
            input_data = $2,
            output_data = $3,
            error = $4,
            tries = $5,
            max_retries = $6,
            next_retry_at = $7,
            worker_id = $8,
            updated_at = $9,
            started_at = $10,
            finished_at = $11
        WHERE id = $12
          AND ($13 IS NULL OR status = $13)
          AND ($14 = 0 OR worker_id IS $15)
        "#,
    )
    .bind(task.status.as_str())
    .bind(serde_json::to_string(&task.input_data)?)
    .bind(output)
    .bind(task.error.as_deref())
    .bind(i64::from(task.tries))
    .bind(i64::from(task.max_retries))
    .bind(task.next_retry_at.as_ref().map(encode_ts))
    .bind(task.worker_id.as_deref())
    .bind(encode_ts(&task.updated_at))
    .bind(task.started_at.as_ref().map(encode_ts))
    .bind(task.finished_at.as_ref().map(encode_ts))
    .bind(&task.id)
    .bind(expected.map(|s| s.as_str()))
    .bind(check_owner)
    .bind(owner)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(updated)
}

pub(super) async fn count_active_on(conn: &mut SqliteConnection, workflow_id: &str) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE workflow_id = $1 AND status IN ('pending', 'running')",
    )
    .bind(workflow_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count.max(0) as u64)
}

async fn insert_log_on(conn: &mut SqliteConnection, log: &TaskLog) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_logs (id, task_id, level, message, created_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(&log.id)
    .bind(&log.task_id)
    .bind(log.level.as_str())
    .bind(&log.message)
    .bind(encode_ts(&log.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_task_on(&mut conn, task, false).await?;
        Ok(())
    }

    async fn enqueue_single_flight(&self, task: &Task) -> Result<bool> {
        // Check and insert are one statement, so no read lock is held first
        let mut conn = self.pool.acquire().await?;
        match insert_task_on(&mut conn, task, true).await {
            Ok(inserted) => Ok(inserted),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(map_task).transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        // LIMIT -1 means unbounded in SQLite
        let limit = filter.limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE ($1 IS NULL OR workflow_id = $1)
              AND ($2 IS NULL OR schedule_id = $2)
              AND ($3 IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
            TASK_COLUMNS
        ))
        .bind(filter.workflow_id.as_deref())
        .bind(filter.schedule_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_task).collect()
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        update_task_on(&mut conn, task, None).await?;
        Ok(())
    }

    async fn transition(
        &self,
        task: &Task,
        guard: TaskGuard<'_>,
        log: Option<&TaskLog>,
    ) -> Result<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        let updated = match update_task_on(&mut tx, task, Some(guard)).await {
            Ok(updated) => updated,
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Ok(ClaimOutcome::Busy);
            }
            Err(e) => return Err(e),
        };
        if updated == 0 {
            tx.rollback().await?;
            return Ok(ClaimOutcome::Lost);
        }

        if let Some(log) = log {
            insert_log_on(&mut tx, log).await?;
        }
        tx.commit().await?;
        Ok(ClaimOutcome::Claimed)
    }

    async fn count_active(&self, workflow_id: &str) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        count_active_on(&mut conn, workflow_id).await
    }

    async fn ready(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
            TASK_COLUMNS
        ))
        .bind(encode_ts(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_task).collect()
    }

    async fn start(
        &self,
        task_id: &str,
        worker_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks SET
                status = 'running',
                tries = tries + 1,
                started_at = $1,
                updated_at = $1,
                worker_id = $2,
                next_retry_at = NULL
            WHERE id = $3 AND status = 'pending'
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(encode_ts(&now))
        .bind(worker_id)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_task).transpose()
    }

    async fn requeue_worker_tasks(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            r#"
            UPDATE tasks SET
                status = CASE WHEN tries >= max_retries THEN 'failed' ELSE 'pending' END,
                error = 'worker ' || $1 || ' lost while running attempt ' || tries,
                worker_id = NULL,
                updated_at = $2,
                finished_at = CASE WHEN tries >= max_retries THEN $2 ELSE NULL END
            WHERE worker_id = $1 AND status = 'running'
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(worker_id)
        .bind(encode_ts(&now))
        .fetch_all(&mut *tx)
        .await?;
        let orphans = rows.iter().map(map_task).collect::<Result<Vec<_>>>()?;

        for task in &orphans {
            let message = task.error.as_deref().unwrap_or("worker lost");
            let log = if task.status == TaskStatus::Failed {
                TaskLog::new(&task.id, LogLevel::Error, format!("{}; retries exhausted", message), now)
            } else {
                TaskLog::new(&task.id, LogLevel::Warning, format!("{}; requeued", message), now)
            };
            insert_log_on(&mut tx, &log).await?;
        }

        tx.commit().await?;
        Ok(orphans.len() as u64)
    }

    async fn append_log(&self, log: &TaskLog) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_log_on(&mut conn, log).await
    }

    async fn list_logs(&self, task_id: &str) -> Result<Vec<TaskLog>> {
        let rows = sqlx::query(
            "SELECT id, task_id, level, message, created_at FROM task_logs \
             WHERE task_id = $1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_log).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn start_is_compare_and_swap() {
        let store = SqliteStore::in_memory().await.unwrap();
        let task = Task::new("wf-1", None, json!({"x": 1}), 3, t0());
        store.create_task(&task).await.unwrap();

        let started = store.start(&task.id, Some("w-1"), t0()).await.unwrap().unwrap();
        assert_eq!(started.status, TaskStatus::Running);
        assert_eq!(started.tries, 1);
        assert_eq!(started.worker_id.as_deref(), Some("w-1"));
        assert_eq!(started.started_at, Some(t0()));

        assert!(store.start(&task.id, Some("w-2"), t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ready_respects_retry_delay() {
        let store = SqliteStore::in_memory().await.unwrap();
        let fresh = Task::new("wf-1", None, json!({}), 3, t0());
        let mut waiting = Task::new("wf-2", None, json!({}), 3, t0());
        waiting.next_retry_at = Some(t0() + Duration::seconds(4));
        store.create_task(&fresh).await.unwrap();
        store.create_task(&waiting).await.unwrap();

        let now = store.ready(t0(), 10).await.unwrap();
        assert_eq!(now.len(), 1);
        assert_eq!(now[0].id, fresh.id);

        let later = store.ready(t0() + Duration::seconds(4), 10).await.unwrap();
        assert_eq!(later.len(), 2);
    }

    #[tokio::test]
    async fn single_flight_rejects_second_scheduled_task() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = Task::new("wf-1", Some("s-1".to_string()), json!({}), 3, t0());
        let b = Task::new("wf-1", Some("s-2".to_string()), json!({}), 3, t0());

        assert!(store.enqueue_single_flight(&a).await.unwrap());
        assert!(!store.enqueue_single_flight(&b).await.unwrap());
        assert_eq!(store.count_active("wf-1").await.unwrap(), 1);

        // The unique index also rejects a raw insert
        assert!(store.create_task(&b).await.is_err());
    }

    #[tokio::test]
    async fn single_flight_also_waits_for_manual_tasks() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut manual = Task::new("wf-1", None, json!({}), 3, t0());
        store.create_task(&manual).await.unwrap();

        let scheduled = Task::new("wf-1", Some("s-1".to_string()), json!({}), 3, t0());
        assert!(!store.enqueue_single_flight(&scheduled).await.unwrap());
        assert!(store.get_task(&scheduled.id).await.unwrap().is_none());

        manual.status = TaskStatus::Completed;
        store.update_task(&manual).await.unwrap();
        assert!(store.enqueue_single_flight(&scheduled).await.unwrap());
    }

    #[tokio::test]
    async fn transition_applies_only_while_guard_holds() {
        let store = SqliteStore::in_memory().await.unwrap();
        let task = Task::new("wf-1", None, json!({}), 3, t0());
        store.create_task(&task).await.unwrap();
        let mut running = store.start(&task.id, Some("w-1"), t0()).await.unwrap().unwrap();

        running.status = TaskStatus::Completed;
        running.output_data = Some(json!({"ok": true}));
        let log = TaskLog::new(&task.id, LogLevel::Info, "done", t0());

        let stolen = store
            .transition(&running, TaskGuard::Running { owner: Some("w-2") }, Some(&log))
            .await
            .unwrap();
        assert_eq!(stolen, ClaimOutcome::Lost);
        assert_eq!(store.get_task(&task.id).await.unwrap().unwrap().status, TaskStatus::Running);
        assert!(store.list_logs(&task.id).await.unwrap().is_empty());

        let owned = store
            .transition(&running, TaskGuard::Running { owner: Some("w-1") }, Some(&log))
            .await
            .unwrap();
        assert_eq!(owned, ClaimOutcome::Claimed);
        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(store.list_logs(&task.id).await.unwrap().len(), 1);

        // Already terminal: a pending-only write is refused
        let mut failed = stored.clone();
        failed.status = TaskStatus::Failed;
        let refused = store.transition(&failed, TaskGuard::Pending, None).await.unwrap();
        assert_eq!(refused, ClaimOutcome::Lost);
        assert_eq!(store.get_task(&task.id).await.unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn transition_reports_single_flight_conflict() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut old = Task::new("wf-1", Some("s-1".to_string()), json!({}), 3, t0());
        old.status = TaskStatus::Failed;
        store.create_task(&old).await.unwrap();
        let fresh = Task::new("wf-1", Some("s-1".to_string()), json!({}), 3, t0());
        assert!(store.enqueue_single_flight(&fresh).await.unwrap());

        let mut reset = old.clone();
        reset.status = TaskStatus::Pending;
        let log = TaskLog::new(&old.id, LogLevel::Info, "manual retry", t0());
        let outcome = store.transition(&reset, TaskGuard::Failed, Some(&log)).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Busy);

        assert_eq!(store.get_task(&old.id).await.unwrap().unwrap().status, TaskStatus::Failed);
        assert!(store.list_logs(&old.id).await.unwrap().is_empty());
        assert_eq!(store.count_active("wf-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeue_returns_orphans_and_logs() {
        let store = SqliteStore::in_memory().await.unwrap();
        let retryable = Task::new("wf-1", None, json!({}), 3, t0());
        let exhausted = Task::new("wf-2", None, json!({}), 1, t0());
        store.create_task(&retryable).await.unwrap();
        store.create_task(&exhausted).await.unwrap();
        store.start(&retryable.id, Some("w-dead"), t0()).await.unwrap();
        store.start(&exhausted.id, Some("w-dead"), t0()).await.unwrap();

        let touched = store.requeue_worker_tasks("w-dead", t0()).await.unwrap();
        assert_eq!(touched, 2);

        let requeued = store.get_task(&retryable.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.tries, 1);
        assert!(requeued.worker_id.is_none());

        let failed = store.get_task(&exhausted.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.finished_at, Some(t0()));

        let logs = store.list_logs(&exhausted.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn list_applies_filters_and_limit() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..3 {
            let task = Task::new("wf-1", None, json!({}), 3, t0() + Duration::seconds(i));
            store.create_task(&task).await.unwrap();
        }
        let other = Task::new("wf-2", None, json!({}), 3, t0());
        store.create_task(&other).await.unwrap();

        let filter = TaskFilter {
            workflow_id: Some("wf-1".to_string()),
            limit: Some(2),
            ..Default::default()
        };
        let rows = store.list_tasks(&filter).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].created_at > rows[1].created_at);

        assert_eq!(store.list_tasks(&TaskFilter::default()).await.unwrap().len(), 4);
    }
}
