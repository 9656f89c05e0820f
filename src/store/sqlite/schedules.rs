use super::tasks::insert_task_on;
use super::{encode_ts, get_enum, get_json, get_ts, is_unique_violation, SqliteStore};
use crate::error::Result;
use crate::schedule::{Schedule, ScheduleFilter, ScheduleStatus};
use crate::store::{ClaimOutcome, ScheduleClaim, ScheduleStore};
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const SCHEDULE_COLUMNS: &str =
    "id, workflow_id, schedule_type, expression, params, status, next_run_at, created_at, updated_at";

fn map_schedule(row: &SqliteRow) -> Result<Schedule> {
    Ok(Schedule {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        schedule_type: get_enum(row, "schedule", "schedule_type")?,
        expression: row.try_get("expression")?,
        params: get_json(row, "params")?,
        status: get_enum(row, "schedule", "status")?,
        next_run_at: get_ts(row, "schedule", "next_run_at")?,
        created_at: get_ts(row, "schedule", "created_at")?,
        updated_at: get_ts(row, "schedule", "updated_at")?,
    })
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn create_schedule(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, workflow_id, schedule_type, expression, params, status, next_run_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.workflow_id)
        .bind(schedule.schedule_type.as_str())
        .bind(&schedule.expression)
        .bind(serde_json::to_string(&schedule.params)?)
        .bind(schedule.status.as_str())
        .bind(encode_ts(&schedule.next_run_at))
        .bind(encode_ts(&schedule.created_at))
        .bind(encode_ts(&schedule.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query(&format!("SELECT {} FROM schedules WHERE id = $1", SCHEDULE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(map_schedule).transpose()
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM schedules
            WHERE ($1 IS NULL OR workflow_id = $1)
              AND ($2 IS NULL OR status = $2)
            ORDER BY created_at DESC
            "#,
            SCHEDULE_COLUMNS
        ))
        .bind(filter.workflow_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_schedule).collect()
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE schedules SET
                schedule_type = $1,
                expression = $2,
                params = $3,
                status = $4,
                next_run_at = $5,
                updated_at = $6
            WHERE id = $7
            "#,
        )
        .bind(schedule.schedule_type.as_str())
        .bind(&schedule.expression)
        .bind(serde_json::to_string(&schedule.params)?)
        .bind(schedule.status.as_str())
        .bind(encode_ts(&schedule.next_run_at))
        .bind(encode_ts(&schedule.updated_at))
        .bind(&schedule.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM schedules
            WHERE status = $1 AND next_run_at <= $2
            ORDER BY next_run_at ASC
            LIMIT $3
            "#,
            SCHEDULE_COLUMNS
        ))
        .bind(ScheduleStatus::Active.as_str())
        .bind(encode_ts(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_schedule).collect()
    }

    async fn claim(&self, claim: &ScheduleClaim, task: Option<&Task>) -> Result<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        // The conditional write comes first so the transaction holds the
        // write lock while inserting.
        let updated = sqlx::query(
            r#"
            UPDATE schedules SET status = $1, next_run_at = $2, updated_at = $3
            WHERE id = $4 AND status = $5 AND next_run_at = $6
            "#,
        )
        .bind(claim.status.as_str())
        .bind(encode_ts(&claim.next_run_at))
        .bind(encode_ts(&claim.now))
        .bind(&claim.schedule_id)
        .bind(claim.expected_status.as_str())
        .bind(encode_ts(&claim.expected_next_run_at))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(ClaimOutcome::Lost);
        }

        if let Some(task) = task {
            let inserted = match insert_task_on(&mut tx, task, true).await {
                Ok(inserted) => inserted,
                Err(e) if is_unique_violation(&e) => false,
                Err(e) => return Err(e),
            };
            if !inserted {
                tx.rollback().await?;
                return Ok(ClaimOutcome::Busy);
            }
        }

        tx.commit().await?;
        Ok(ClaimOutcome::Claimed)
    }
}
