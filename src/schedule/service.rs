/// Schedule management operations
///
/// Creation and expression updates validate synchronously, so a bad expression
/// never reaches the store. Every operation takes `now` explicitly; the worker
/// loop and the tests drive the clock.

use crate::error::{Error, Result};
use crate::schedule::calculator::NextRunCalculator;
use crate::schedule::types::{Schedule, ScheduleFilter, ScheduleStatus, ScheduleType};
use crate::store::{ScheduleStore, WorkflowStore};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

pub struct ScheduleService {
    schedules: Arc<dyn ScheduleStore>,
    workflows: Arc<dyn WorkflowStore>,
    calculator: NextRunCalculator,
}

impl ScheduleService {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        workflows: Arc<dyn WorkflowStore>,
        calculator: NextRunCalculator,
    ) -> Self {
        Self {
            schedules,
            workflows,
            calculator,
        }
    }

    /// Validate the workflow and expression, then persist an active schedule
    pub async fn create(
        &self,
        workflow_id: &str,
        schedule_type: ScheduleType,
        expression: &str,
        params: Value,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        if self.workflows.get_workflow(workflow_id).await?.is_none() {
            return Err(Error::WorkflowNotFound {
                id: workflow_id.to_string(),
            });
        }

        let next = self
            .calculator
            .compute_next(schedule_type, expression, now)?
            .with_timezone(&Utc);
        let schedule = Schedule::new(workflow_id, schedule_type, expression, params, next, now);
        self.schedules.create_schedule(&schedule).await?;

        tracing::info!(
            "📅 Created {} schedule {} for workflow {} ('{}', next run {})",
            schedule_type,
            schedule.id,
            workflow_id,
            expression,
            next
        );
        Ok(schedule)
    }

    pub async fn get(&self, id: &str) -> Result<Schedule> {
        self.schedules
            .get_schedule(id)
            .await?
            .ok_or_else(|| Error::ScheduleNotFound { id: id.to_string() })
    }

    pub async fn list(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        self.schedules.list_schedules(filter).await
    }

    pub async fn pause(&self, id: &str, now: DateTime<Utc>) -> Result<Schedule> {
        let mut schedule = self.get(id).await?;
        match schedule.status {
            ScheduleStatus::Paused => return Ok(schedule),
            ScheduleStatus::Active => {}
            from => return Err(transition(from, ScheduleStatus::Paused)),
        }

        schedule.status = ScheduleStatus::Paused;
        schedule.updated_at = now;
        self.schedules.update_schedule(&schedule).await?;
        tracing::info!("⏸️ Paused schedule {}", id);
        Ok(schedule)
    }

    /// Reactivate a paused or stopped schedule
    ///
    /// next_run_at is recomputed from `now` so missed fires are not replayed.
    /// A oneshot whose instant has passed cannot be resumed.
    pub async fn resume(&self, id: &str, now: DateTime<Utc>) -> Result<Schedule> {
        let mut schedule = self.get(id).await?;
        match schedule.status {
            ScheduleStatus::Active => return Ok(schedule),
            ScheduleStatus::Paused | ScheduleStatus::Stopped => {}
            from => return Err(transition(from, ScheduleStatus::Active)),
        }

        schedule.next_run_at = self
            .calculator
            .compute_next(schedule.schedule_type, &schedule.expression, now)?
            .with_timezone(&Utc);
        schedule.status = ScheduleStatus::Active;
        schedule.updated_at = now;
        self.schedules.update_schedule(&schedule).await?;

        tracing::info!("▶️ Resumed schedule {} (next run {})", id, schedule.next_run_at);
        Ok(schedule)
    }

    pub async fn stop(&self, id: &str, now: DateTime<Utc>) -> Result<Schedule> {
        let mut schedule = self.get(id).await?;
        match schedule.status {
            ScheduleStatus::Stopped => return Ok(schedule),
            ScheduleStatus::Active | ScheduleStatus::Paused => {}
            from => return Err(transition(from, ScheduleStatus::Stopped)),
        }

        schedule.status = ScheduleStatus::Stopped;
        schedule.updated_at = now;
        self.schedules.update_schedule(&schedule).await?;
        tracing::info!("⏹️ Stopped schedule {}", id);
        Ok(schedule)
    }

    /// Replace the expression (same type) and recompute next_run_at from `now`
    pub async fn update_expression(
        &self,
        id: &str,
        expression: &str,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let mut schedule = self.get(id).await?;
        if schedule.status == ScheduleStatus::Completed {
            return Err(transition(ScheduleStatus::Completed, ScheduleStatus::Completed));
        }

        schedule.next_run_at = self
            .calculator
            .compute_next(schedule.schedule_type, expression, now)?
            .with_timezone(&Utc);
        schedule.expression = expression.to_string();
        schedule.updated_at = now;
        self.schedules.update_schedule(&schedule).await?;

        tracing::info!(
            "✏️ Updated schedule {} expression to '{}' (next run {})",
            id,
            expression,
            schedule.next_run_at
        );
        Ok(schedule)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if !self.schedules.delete_schedule(id).await? {
            return Err(Error::ScheduleNotFound { id: id.to_string() });
        }
        tracing::info!("🗑️ Deleted schedule {}", id);
        Ok(())
    }
}

fn transition(from: ScheduleStatus, to: ScheduleStatus) -> Error {
    Error::InvalidStateTransition {
        entity: "schedule".to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::workflow::Workflow;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    async fn service() -> ScheduleService {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        store
            .save_workflow(&Workflow::new("wf-1", "Report", "remote-1", t0()).with_components("in", "out"))
            .await
            .unwrap();
        ScheduleService::new(store.clone(), store, NextRunCalculator::default())
    }

    #[tokio::test]
    async fn create_interval_sets_first_run() {
        let svc = service().await;
        let schedule = svc
            .create("wf-1", ScheduleType::Interval, "30m", json!({"k": "v"}), t0())
            .await
            .unwrap();

        assert_eq!(schedule.next_run_at, t0() + Duration::minutes(30));
        assert_eq!(schedule.status, ScheduleStatus::Active);
        assert_eq!(svc.get(&schedule.id).await.unwrap(), schedule);
    }

    #[tokio::test]
    async fn create_rejects_unknown_workflow_and_bad_expression() {
        let svc = service().await;
        let err = svc
            .create("nope", ScheduleType::Interval, "30m", json!({}), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkflowNotFound { .. }));

        let err = svc
            .create("wf-1", ScheduleType::Interval, "0m", json!({}), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidScheduleExpression { .. }));
        assert!(svc.list(&ScheduleFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_resume_recomputes_from_now() {
        let svc = service().await;
        let schedule = svc
            .create("wf-1", ScheduleType::Interval, "1h", json!({}), t0())
            .await
            .unwrap();

        let paused = svc.pause(&schedule.id, t0()).await.unwrap();
        assert_eq!(paused.status, ScheduleStatus::Paused);

        let later = t0() + Duration::hours(5);
        let resumed = svc.resume(&schedule.id, later).await.unwrap();
        assert_eq!(resumed.status, ScheduleStatus::Active);
        assert_eq!(resumed.next_run_at, later + Duration::hours(1));

        let stopped = svc.stop(&schedule.id, later).await.unwrap();
        assert_eq!(stopped.status, ScheduleStatus::Stopped);
        let err = svc.pause(&schedule.id, later).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn update_expression_validates_and_reschedules() {
        let svc = service().await;
        let schedule = svc
            .create("wf-1", ScheduleType::Interval, "1h", json!({}), t0())
            .await
            .unwrap();

        let err = svc.update_expression(&schedule.id, "abc", t0()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidScheduleExpression { .. }));

        let updated = svc.update_expression(&schedule.id, "10s", t0()).await.unwrap();
        assert_eq!(updated.expression, "10s");
        assert_eq!(updated.next_run_at, t0() + Duration::seconds(10));

        svc.delete(&schedule.id).await.unwrap();
        assert!(matches!(
            svc.delete(&schedule.id).await.unwrap_err(),
            Error::ScheduleNotFound { .. }
        ));
    }
}
