/// Persistence contracts
///
/// The runtime depends only on these traits. The store is the single
/// synchronization point between worker processes, so the operations that
/// guard against double dispatch (`ScheduleStore::claim`,
/// `TaskStore::enqueue_single_flight`, `TaskStore::start`,
/// `TaskStore::transition`) must be atomic in every implementation.

use crate::error::Result;
use crate::schedule::{Schedule, ScheduleFilter, ScheduleStatus};
use crate::task::{Task, TaskFilter, TaskLog};
use crate::worker::{Worker, WorkerStatus};
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Conditional schedule mutation used by dispatch
///
/// Applied only if the row still has `expected_status` and
/// `expected_next_run_at`. Two dispatchers that read the same due row race
/// on this compare-and-swap and exactly one wins.
#[derive(Debug, Clone)]
pub struct ScheduleClaim {
    pub schedule_id: String,
    pub expected_status: ScheduleStatus,
    pub expected_next_run_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Row updated (and the task or log, if any, inserted) in one transaction
    Claimed,
    /// The workflow already has a pending or running scheduled task; nothing changed
    Busy,
    /// Another writer changed the row first; nothing changed
    Lost,
}

/// State a task row must still be in for [`TaskStore::transition`] to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskGuard<'a> {
    Pending,
    /// Running under this owner (`None` for runs without a worker)
    Running { owner: Option<&'a str> },
    Failed,
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()>;
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;
    async fn list_workflows(&self) -> Result<Vec<Workflow>>;
    async fn delete_workflow(&self, id: &str) -> Result<bool>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create_schedule(&self, schedule: &Schedule) -> Result<()>;
    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>>;
    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>>;
    /// Unconditional overwrite of the mutable columns
    async fn update_schedule(&self, schedule: &Schedule) -> Result<()>;
    async fn delete_schedule(&self, id: &str) -> Result<bool>;

    /// Active schedules with `next_run_at <= now`, oldest first
    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Schedule>>;

    /// Atomically apply `claim` and insert `task` under the single-flight guard
    async fn claim(&self, claim: &ScheduleClaim, task: Option<&Task>) -> Result<ClaimOutcome>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<()>;

    /// Insert unless the workflow already has a pending or running task.
    /// Returns false when the guard rejected the insert.
    async fn enqueue_single_flight(&self, task: &Task) -> Result<bool>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;
    /// Unconditional overwrite of the mutable columns
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Overwrite the mutable columns only while `guard` holds, appending
    /// `log` in the same transaction. `Busy` means the write would break
    /// single-flight; `Lost` means the row no longer matches the guard.
    async fn transition(
        &self,
        task: &Task,
        guard: TaskGuard<'_>,
        log: Option<&TaskLog>,
    ) -> Result<ClaimOutcome>;

    /// Number of pending or running tasks for a workflow
    async fn count_active(&self, workflow_id: &str) -> Result<u64>;

    /// Pending tasks whose retry delay has elapsed, oldest first
    async fn ready(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Task>>;

    /// Compare-and-swap `pending -> running`, incrementing tries.
    /// Returns the updated task, or None if it was no longer pending.
    async fn start(
        &self,
        task_id: &str,
        worker_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>>;

    /// Return running tasks owned by `worker_id` to pending (or failed when
    /// their retries are exhausted). Returns the number of tasks touched.
    async fn requeue_worker_tasks(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64>;

    async fn append_log(&self, log: &TaskLog) -> Result<()>;
    async fn list_logs(&self, task_id: &str) -> Result<Vec<TaskLog>>;
}

#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn insert_worker(&self, worker: &Worker) -> Result<()>;
    async fn get_worker(&self, id: &str) -> Result<Option<Worker>>;
    async fn list_workers(&self) -> Result<Vec<Worker>>;

    /// Refresh last_heartbeat and stats; returns the stored status, or None if
    /// the row no longer exists
    async fn heartbeat(
        &self,
        id: &str,
        stats: &Value,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerStatus>>;

    async fn set_worker_status(&self, id: &str, status: WorkerStatus, now: DateTime<Utc>) -> Result<bool>;
    async fn set_current_task(&self, id: &str, task_id: Option<&str>, now: DateTime<Utc>) -> Result<()>;

    /// Workers (any status) whose heartbeat is older than `cutoff`
    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Worker>>;

    async fn delete_worker(&self, id: &str) -> Result<bool>;
}
