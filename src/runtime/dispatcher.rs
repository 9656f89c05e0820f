/// Due schedule dispatch
///
/// Turns due schedules into pending tasks. Each schedule is handled in its own
/// store transaction: the schedule row is claimed with a compare-and-swap on
/// (status, next_run_at), the single-flight guard is checked, and the task is
/// inserted. Concurrent dispatchers reading the same due row race on the CAS
/// and exactly one of them creates the task.

use crate::error::Result;
use crate::schedule::{NextRunCalculator, Schedule, ScheduleStatus, ScheduleType};
use crate::store::{ClaimOutcome, ScheduleClaim, ScheduleStore, TaskStore};
use crate::task::{RetryPolicy, Task, TaskFilter};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Substrate fires may land slightly before the stored slot
const FIRE_TOLERANCE_SECS: i64 = 1;

/// Result of dispatching a single schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Task created and schedule advanced (or completed)
    Dispatched,
    /// Workflow already has a pending or running scheduled task
    Busy,
    /// Another dispatcher handled this fire first
    Lost,
    /// Schedule missing or not in a state that fires
    Skipped,
}

impl From<ClaimOutcome> for DispatchOutcome {
    fn from(outcome: ClaimOutcome) -> Self {
        match outcome {
            ClaimOutcome::Claimed => DispatchOutcome::Dispatched,
            ClaimOutcome::Busy => DispatchOutcome::Busy,
            ClaimOutcome::Lost => DispatchOutcome::Lost,
        }
    }
}

/// Per-tick dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub due: u64,
    pub dispatched: u64,
    pub busy: u64,
    pub lost: u64,
    pub errors: u64,
}

pub struct DueScheduleDispatcher {
    schedules: Arc<dyn ScheduleStore>,
    tasks: Arc<dyn TaskStore>,
    calculator: NextRunCalculator,
    retry: RetryPolicy,
    batch: u32,
}

impl DueScheduleDispatcher {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        tasks: Arc<dyn TaskStore>,
        calculator: NextRunCalculator,
        retry: RetryPolicy,
        batch: u32,
    ) -> Self {
        Self {
            schedules,
            tasks,
            calculator,
            retry,
            batch,
        }
    }

    /// Dispatch every due schedule
    ///
    /// Only a failure to read the due set is returned as an error. A schedule
    /// that fails (bad expression, store error) is logged, counted, and left
    /// due so that a fix takes effect on the next tick.
    pub async fn dispatch(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let due = self.schedules.due(now, self.batch).await?;
        let mut report = DispatchReport {
            due: due.len() as u64,
            ..Default::default()
        };

        for schedule in &due {
            match self.dispatch_one(schedule, now).await {
                Ok(DispatchOutcome::Dispatched) => report.dispatched += 1,
                Ok(DispatchOutcome::Busy) => {
                    report.busy += 1;
                    tracing::debug!(
                        "⏳ Workflow {} still has a task in flight, schedule {} deferred",
                        schedule.workflow_id,
                        schedule.id
                    );
                }
                Ok(DispatchOutcome::Lost) => {
                    report.lost += 1;
                    tracing::debug!("🤝 Schedule {} was dispatched by another worker", schedule.id);
                }
                Ok(DispatchOutcome::Skipped) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!("❌ Failed to dispatch schedule {}: {}", schedule.id, e);
                }
            }
        }

        if report.dispatched > 0 {
            tracing::info!("📤 Dispatched {} of {} due schedule(s)", report.dispatched, report.due);
        }
        Ok(report)
    }

    /// Claim one due schedule and create its task atomically
    pub async fn dispatch_one(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        if schedule.status != ScheduleStatus::Active {
            return Ok(DispatchOutcome::Skipped);
        }

        let (next_run_at, status) = if schedule.schedule_type.is_repeating() {
            let next = self
                .calculator
                .compute_next(schedule.schedule_type, &schedule.expression, now)?
                .with_timezone(&Utc);
            (next, ScheduleStatus::Active)
        } else {
            // A oneshot fires once; next_run_at keeps the fire time
            (schedule.next_run_at, ScheduleStatus::Completed)
        };

        let task = self.task_for(schedule, now);
        let claim = ScheduleClaim {
            schedule_id: schedule.id.clone(),
            expected_status: ScheduleStatus::Active,
            expected_next_run_at: schedule.next_run_at,
            next_run_at,
            status,
            now,
        };

        let outcome = self.schedules.claim(&claim, Some(&task)).await?;
        if outcome == ClaimOutcome::Claimed {
            tracing::info!(
                "📨 Schedule {} fired task {} for workflow {} (next: {})",
                schedule.id,
                task.id,
                schedule.workflow_id,
                if status == ScheduleStatus::Completed {
                    "completed".to_string()
                } else {
                    next_run_at.to_rfc3339()
                }
            );
        }
        Ok(outcome.into())
    }

    /// Mark an active oneshot completed without creating a task
    ///
    /// Used by the beat adapter when it hands the oneshot to the substrate.
    /// Returns false when another instance reserved it first.
    pub async fn reserve_oneshot(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<bool> {
        if schedule.schedule_type != ScheduleType::Oneshot || schedule.status != ScheduleStatus::Active {
            return Ok(false);
        }

        let claim = ScheduleClaim {
            schedule_id: schedule.id.clone(),
            expected_status: ScheduleStatus::Active,
            expected_next_run_at: schedule.next_run_at,
            next_run_at: schedule.next_run_at,
            status: ScheduleStatus::Completed,
            now,
        };
        Ok(self.schedules.claim(&claim, None).await? == ClaimOutcome::Claimed)
    }

    /// Return a reserved (completed, unfired) oneshot to active
    pub async fn release_oneshot(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<bool> {
        let claim = ScheduleClaim {
            schedule_id: schedule.id.clone(),
            expected_status: ScheduleStatus::Completed,
            expected_next_run_at: schedule.next_run_at,
            next_run_at: schedule.next_run_at,
            status: ScheduleStatus::Active,
            now,
        };
        Ok(self.schedules.claim(&claim, None).await? == ClaimOutcome::Claimed)
    }

    /// Beat entry point: one substrate fire for `schedule_id`
    ///
    /// Repeating schedules go through the same claim as polling. A reserved
    /// oneshot (already completed) only needs its task; if the workflow is
    /// busy the oneshot is reactivated so it fires once the workflow is free.
    pub async fn fire(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let schedule = match self.schedules.get_schedule(schedule_id).await? {
            Some(schedule) => schedule,
            None => return Ok(DispatchOutcome::Skipped),
        };

        match (schedule.schedule_type, schedule.status) {
            (ScheduleType::Oneshot, ScheduleStatus::Completed) => {
                let fired = TaskFilter {
                    schedule_id: Some(schedule.id.clone()),
                    limit: Some(1),
                    ..Default::default()
                };
                if !self.tasks.list_tasks(&fired).await?.is_empty() {
                    return Ok(DispatchOutcome::Lost);
                }

                let task = self.task_for(&schedule, now);
                if self.tasks.enqueue_single_flight(&task).await? {
                    tracing::info!("📨 Oneshot {} fired task {}", schedule.id, task.id);
                    return Ok(DispatchOutcome::Dispatched);
                }

                self.release_oneshot(&schedule, now).await?;
                tracing::debug!("⏳ Oneshot {} deferred, workflow {} busy", schedule.id, schedule.workflow_id);
                Ok(DispatchOutcome::Busy)
            }
            // A cron split over both day fields fires twice on days matching both
            (ScheduleType::Cron, ScheduleStatus::Active)
                if schedule.next_run_at > now + Duration::seconds(FIRE_TOLERANCE_SECS) =>
            {
                tracing::debug!("⏭️ Cron schedule {} already fired for this slot", schedule.id);
                Ok(DispatchOutcome::Skipped)
            }
            (_, ScheduleStatus::Active) => self.dispatch_one(&schedule, now).await,
            _ => Ok(DispatchOutcome::Skipped),
        }
    }

    fn task_for(&self, schedule: &Schedule, now: DateTime<Utc>) -> Task {
        Task::new(
            schedule.workflow_id.clone(),
            Some(schedule.id.clone()),
            schedule.params.clone(),
            self.retry.max_retries,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::task::TaskStatus;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    async fn setup() -> (Arc<SqliteStore>, DueScheduleDispatcher) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let dispatcher = DueScheduleDispatcher::new(
            store.clone(),
            store.clone(),
            NextRunCalculator::default(),
            RetryPolicy::default(),
            100,
        );
        (store, dispatcher)
    }

    #[tokio::test]
    async fn bad_expression_is_left_due_and_does_not_block_batch() {
        let (store, dispatcher) = setup().await;
        let broken = Schedule::new("wf-1", ScheduleType::Cron, "not a cron", json!({}), t0(), t0());
        let healthy = Schedule::new("wf-2", ScheduleType::Interval, "1h", json!({"x": 1}), t0(), t0());
        store.create_schedule(&broken).await.unwrap();
        store.create_schedule(&healthy).await.unwrap();

        let report = dispatcher.dispatch(t0()).await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.errors, 1);

        let still_due = store.get_schedule(&broken.id).await.unwrap().unwrap();
        assert_eq!(still_due.status, ScheduleStatus::Active);
        assert!(still_due.is_due(t0()));

        let advanced = store.get_schedule(&healthy.id).await.unwrap().unwrap();
        assert_eq!(advanced.next_run_at, t0() + Duration::hours(1));
    }

    #[tokio::test]
    async fn busy_workflow_defers_schedule() {
        let (store, dispatcher) = setup().await;
        let schedule = Schedule::new("wf-1", ScheduleType::Interval, "5m", json!({}), t0(), t0());
        store.create_schedule(&schedule).await.unwrap();
        let running = Task::new("wf-1", Some("other".to_string()), json!({}), 3, t0());
        store.create_task(&running).await.unwrap();

        let report = dispatcher.dispatch(t0()).await.unwrap();
        assert_eq!(report.busy, 1);
        assert_eq!(
            store.get_schedule(&schedule.id).await.unwrap().unwrap().next_run_at,
            schedule.next_run_at
        );
    }

    #[tokio::test]
    async fn reserved_oneshot_fires_once() {
        let (store, dispatcher) = setup().await;
        let oneshot = Schedule::new("wf-1", ScheduleType::Oneshot, "now", json!({"go": true}), t0(), t0());
        store.create_schedule(&oneshot).await.unwrap();

        assert!(dispatcher.reserve_oneshot(&oneshot, t0()).await.unwrap());
        assert!(!dispatcher.reserve_oneshot(&oneshot, t0()).await.unwrap());

        assert_eq!(dispatcher.fire(&oneshot.id, t0()).await.unwrap(), DispatchOutcome::Dispatched);
        assert_eq!(dispatcher.fire(&oneshot.id, t0()).await.unwrap(), DispatchOutcome::Lost);

        let tasks = store
            .list_tasks(&TaskFilter {
                schedule_id: Some(oneshot.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].input_data, json!({"go": true}));
    }

    #[tokio::test]
    async fn busy_oneshot_fire_reactivates_schedule() {
        let (store, dispatcher) = setup().await;
        let oneshot = Schedule::new("wf-1", ScheduleType::Oneshot, "now", json!({}), t0(), t0());
        store.create_schedule(&oneshot).await.unwrap();
        store
            .create_task(&Task::new("wf-1", None, json!({}), 3, t0()))
            .await
            .unwrap();

        assert!(dispatcher.reserve_oneshot(&oneshot, t0()).await.unwrap());
        assert_eq!(dispatcher.fire(&oneshot.id, t0()).await.unwrap(), DispatchOutcome::Busy);

        let stored = store.get_schedule(&oneshot.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Active);
        assert_eq!(dispatcher.fire("missing", t0()).await.unwrap(), DispatchOutcome::Skipped);
    }

    #[tokio::test]
    async fn cron_fire_for_an_already_claimed_slot_is_skipped() {
        let (store, dispatcher) = setup().await;
        // 2026-06-01 is a Monday: both jobs of "0 0 1 * 1" fire at midnight
        let slot = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let cron = Schedule::new("wf-1", ScheduleType::Cron, "0 0 1 * 1", json!({}), slot, t0());
        store.create_schedule(&cron).await.unwrap();

        assert_eq!(dispatcher.fire(&cron.id, slot).await.unwrap(), DispatchOutcome::Dispatched);
        let mut task = store.list_tasks(&TaskFilter::default()).await.unwrap().remove(0);
        task.status = TaskStatus::Completed;
        store.update_task(&task).await.unwrap();

        assert_eq!(dispatcher.fire(&cron.id, slot).await.unwrap(), DispatchOutcome::Skipped);
        assert_eq!(store.list_tasks(&TaskFilter::default()).await.unwrap().len(), 1);

        let stored = store.get_schedule(&cron.id).await.unwrap().unwrap();
        assert_eq!(stored.next_run_at, Utc.with_ymd_and_hms(2026, 6, 8, 0, 0, 0).unwrap());
    }
}
