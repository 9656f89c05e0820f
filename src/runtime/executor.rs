/// Task execution state machine
///
/// Drives one task through pending -> running -> {completed, pending (retry),
/// failed}. The remote call is the only blocking step; every transition is
/// persisted before and after it so a crash mid-call leaves a `running` row
/// that the reaper can recover. The write after the call applies only while
/// this run still owns the row.

use crate::error::{Error, ExecutionError, Result};
use crate::store::{ClaimOutcome, TaskGuard, TaskStore, WorkerStore, WorkflowStore};
use crate::task::{LogLevel, RetryPolicy, Task, TaskLog, TaskStatus};
use crate::workflow::WorkflowRunner;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// What a call to [`TaskExecutor::run`] did
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Task),
    /// Attempt failed and the task went back to pending with a retry delay
    Retrying(Task),
    Failed(Task),
    /// Task was not pending (already terminal, running elsewhere, or lost the
    /// start race), or the row was taken over while the runner was busy
    Skipped(Task),
}

impl RunOutcome {
    pub fn task(&self) -> &Task {
        match self {
            RunOutcome::Completed(t)
            | RunOutcome::Retrying(t)
            | RunOutcome::Failed(t)
            | RunOutcome::Skipped(t) => t,
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            RunOutcome::Completed(t)
            | RunOutcome::Retrying(t)
            | RunOutcome::Failed(t)
            | RunOutcome::Skipped(t) => t,
        }
    }
}

pub struct TaskExecutor {
    tasks: Arc<dyn TaskStore>,
    workflows: Arc<dyn WorkflowStore>,
    workers: Arc<dyn WorkerStore>,
    runner: Arc<dyn WorkflowRunner>,
    retry: RetryPolicy,
}

impl TaskExecutor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        workflows: Arc<dyn WorkflowStore>,
        workers: Arc<dyn WorkerStore>,
        runner: Arc<dyn WorkflowRunner>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tasks,
            workflows,
            workers,
            runner,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute a pending task once
    ///
    /// Calling this on a task that is not pending is a no-op returning the
    /// current row. `worker_id` records ownership for crash recovery.
    pub async fn run(&self, task_id: &str, worker_id: Option<&str>) -> Result<RunOutcome> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound {
                id: task_id.to_string(),
            })?;

        if task.status != TaskStatus::Pending {
            tracing::debug!("⏭️ Task {} is {}, nothing to run", task.id, task.status);
            return Ok(RunOutcome::Skipped(task));
        }

        let workflow = match self.workflows.get_workflow(&task.workflow_id).await? {
            Some(workflow) => workflow,
            None => {
                let err = Error::WorkflowNotFound {
                    id: task.workflow_id.clone(),
                };
                return self.fail_without_attempt(task, &err).await;
            }
        };

        if let Some(missing) = workflow.missing_component() {
            let err = Error::ComponentNotConfigured {
                workflow_id: workflow.id.clone(),
                missing: missing.to_string(),
            };
            return self.fail_without_attempt(task, &err).await;
        }

        let mut task = match self.tasks.start(&task.id, worker_id, Utc::now()).await? {
            Some(started) => started,
            None => {
                // Someone else moved it out of pending between the read and the CAS
                let current = self.tasks.get_task(task_id).await?.unwrap_or(task);
                return Ok(RunOutcome::Skipped(current));
            }
        };

        tracing::info!(
            "🚀 Running task {} for workflow {} (attempt {}/{})",
            task.id,
            workflow.id,
            task.tries,
            task.max_retries
        );
        self.mark_current(worker_id, Some(&task.id)).await;

        let result = self.runner.execute(&workflow.remote_id, &task.input_data).await;
        let now = Utc::now();

        let outcome = match result {
            Ok(output) => {
                task.status = TaskStatus::Completed;
                task.output_data = Some(output);
                task.error = None;
                task.finished_at = Some(now);
                task.updated_at = now;
                if self.finish_attempt(&task, worker_id, None).await? {
                    tracing::info!("✅ Task {} completed", task.id);
                    RunOutcome::Completed(task)
                } else {
                    self.superseded(task).await?
                }
            }
            Err(err) => self.record_failure(task, err, worker_id, now).await?,
        };

        self.mark_current(worker_id, None).await;
        Ok(outcome)
    }

    /// Operator-initiated retry of a failed task
    ///
    /// Resets tries to zero and clears the previous attempt; the old error is
    /// preserved in the task log. Only failed tasks with retries left qualify.
    pub async fn retry(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let mut task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound {
                id: task_id.to_string(),
            })?;

        if task.status != TaskStatus::Failed {
            return Err(Error::InvalidStateTransition {
                entity: "task".to_string(),
                from: task.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        if task.retries_exhausted() {
            return Err(Error::MaxRetriesExceeded {
                task_id: task.id,
                tries: task.tries,
                max_retries: task.max_retries,
            });
        }

        let previous = task.error.take().unwrap_or_else(|| "no error recorded".to_string());
        let log = TaskLog::new(
            &task.id,
            LogLevel::Info,
            format!("manual retry after {} attempt(s); previous error: {}", task.tries, previous),
            now,
        );

        task.status = TaskStatus::Pending;
        task.tries = 0;
        task.next_retry_at = None;
        task.worker_id = None;
        task.started_at = None;
        task.finished_at = None;
        task.updated_at = now;

        match self.tasks.transition(&task, TaskGuard::Failed, Some(&log)).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Busy => {
                return Err(Error::WorkflowBusy {
                    workflow_id: task.workflow_id,
                });
            }
            ClaimOutcome::Lost => {
                let from = match self.tasks.get_task(&task.id).await? {
                    Some(current) => current.status.to_string(),
                    None => "deleted".to_string(),
                };
                return Err(Error::InvalidStateTransition {
                    entity: "task".to_string(),
                    from,
                    to: TaskStatus::Pending.to_string(),
                });
            }
        }

        tracing::info!("🔁 Task {} queued for manual retry", task.id);
        Ok(task)
    }

    async fn record_failure(
        &self,
        mut task: Task,
        err: ExecutionError,
        owner: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        task.error = Some(err.message.clone());
        task.updated_at = now;

        let (outcome_retry, log) = if err.retriable && !task.retries_exhausted() {
            let delay = self.retry.backoff(task.tries);
            task.status = TaskStatus::Pending;
            task.next_retry_at = Some(now + delay);
            task.finished_at = None;
            let log = format!(
                "attempt {}/{} failed, retrying in {}s: {}",
                task.tries,
                task.max_retries,
                delay.num_seconds(),
                err.message
            );
            (true, log)
        } else {
            task.status = TaskStatus::Failed;
            task.next_retry_at = None;
            task.finished_at = Some(now);
            let reason = if err.retriable { "retries exhausted" } else { "not retriable" };
            let log = format!(
                "attempt {}/{} failed ({}): {}",
                task.tries, task.max_retries, reason, err.message
            );
            (false, log)
        };

        let entry = TaskLog::new(&task.id, LogLevel::Error, &log, now);
        if !self.finish_attempt(&task, owner, Some(&entry)).await? {
            return self.superseded(task).await;
        }

        if outcome_retry {
            tracing::warn!("🔁 Task {}: {}", task.id, log);
            Ok(RunOutcome::Retrying(task))
        } else {
            tracing::error!("❌ Task {}: {}", task.id, log);
            Ok(RunOutcome::Failed(task))
        }
    }

    /// Terminal failure detected before the runner is called; tries stay unchanged
    async fn fail_without_attempt(&self, mut task: Task, err: &Error) -> Result<RunOutcome> {
        let now = Utc::now();
        task.status = TaskStatus::Failed;
        task.error = Some(err.to_string());
        task.next_retry_at = None;
        task.finished_at = Some(now);
        task.updated_at = now;

        let log = TaskLog::new(&task.id, LogLevel::Error, err.to_string(), now);
        if self.tasks.transition(&task, TaskGuard::Pending, Some(&log)).await? != ClaimOutcome::Claimed {
            tracing::debug!("⏭️ Task {} left pending before it could be failed", task.id);
            let current = self.tasks.get_task(&task.id).await?.unwrap_or(task);
            return Ok(RunOutcome::Skipped(current));
        }

        tracing::error!("❌ Task {} failed before execution: {}", task.id, err);
        Ok(RunOutcome::Failed(task))
    }

    /// Write the end of an attempt only if this run still owns the row
    async fn finish_attempt(&self, task: &Task, owner: Option<&str>, log: Option<&TaskLog>) -> Result<bool> {
        let outcome = self
            .tasks
            .transition(task, TaskGuard::Running { owner }, log)
            .await?;
        Ok(outcome == ClaimOutcome::Claimed)
    }

    /// The row was requeued or restarted elsewhere mid-call; keep the newer state
    async fn superseded(&self, task: Task) -> Result<RunOutcome> {
        tracing::warn!(
            "⚠️ Task {} was taken over during attempt {}, discarding its result",
            task.id,
            task.tries
        );
        let current = self.tasks.get_task(&task.id).await?.unwrap_or(task);
        Ok(RunOutcome::Skipped(current))
    }

    async fn mark_current(&self, worker_id: Option<&str>, task_id: Option<&str>) {
        if let Some(worker_id) = worker_id {
            if let Err(e) = self.workers.set_current_task(worker_id, task_id, Utc::now()).await {
                tracing::warn!("⚠️ Failed to record current task for worker {}: {}", worker_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::task::TaskFilter;
    use crate::workflow::Workflow;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedRunner {
        calls: AtomicUsize,
        result: std::result::Result<Value, ExecutionError>,
    }

    #[async_trait]
    impl WorkflowRunner for ScriptedRunner {
        async fn execute(
            &self,
            _remote_workflow_id: &str,
            _input: &Value,
        ) -> std::result::Result<Value, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    async fn setup(
        result: std::result::Result<Value, ExecutionError>,
        workflow: Workflow,
    ) -> (Arc<SqliteStore>, Arc<ScriptedRunner>, TaskExecutor) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.save_workflow(&workflow).await.unwrap();
        let runner = Arc::new(ScriptedRunner {
            calls: AtomicUsize::new(0),
            result,
        });
        let executor = TaskExecutor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            runner.clone(),
            RetryPolicy::default(),
        );
        (store, runner, executor)
    }

    fn wired() -> Workflow {
        Workflow::new("wf-1", "Report", "remote-1", Utc::now()).with_components("in", "out")
    }

    #[tokio::test]
    async fn success_stores_output() {
        let (store, runner, executor) = setup(Ok(json!({"rows": 3})), wired()).await;
        let task = Task::new("wf-1", None, json!({"day": 1}), 3, Utc::now());
        store.create_task(&task).await.unwrap();

        let outcome = executor.run(&task.id, None).await.unwrap();
        let done = outcome.task();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(done.output_data, Some(json!({"rows": 3})));
        assert_eq!(done.tries, 1);
        assert!(done.finished_at.is_some());

        // Terminal task: second run does not call the runner
        let again = executor.run(&task.id, None).await.unwrap();
        assert!(matches!(again, RunOutcome::Skipped(_)));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_component_fails_without_attempt() {
        let workflow = Workflow::new("wf-1", "Report", "remote-1", Utc::now());
        let (store, runner, executor) = setup(Ok(json!({})), workflow).await;
        let task = Task::new("wf-1", None, json!({}), 3, Utc::now());
        store.create_task(&task).await.unwrap();

        let failed = executor.run(&task.id, None).await.unwrap().into_task();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.tries, 0);
        assert!(failed.error.unwrap().contains("input"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.list_logs(&task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fatal_error_skips_retry() {
        let (store, _runner, executor) =
            setup(Err(ExecutionError::fatal("flow not found")), wired()).await;
        let task = Task::new("wf-1", None, json!({}), 3, Utc::now());
        store.create_task(&task).await.unwrap();

        let failed = executor.run(&task.id, None).await.unwrap().into_task();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.tries, 1);
        assert_eq!(failed.error.as_deref(), Some("flow not found"));
    }

    #[tokio::test]
    async fn retriable_failure_sets_backoff() {
        let (store, _runner, executor) =
            setup(Err(ExecutionError::retriable("503")), wired()).await;
        let task = Task::new("wf-1", None, json!({}), 3, Utc::now());
        store.create_task(&task).await.unwrap();

        let outcome = executor.run(&task.id, None).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Retrying(_)));
        let pending = outcome.into_task();
        assert_eq!(pending.status, TaskStatus::Pending);
        assert!(pending.finished_at.is_none());
        let delay = pending.next_retry_at.unwrap() - pending.updated_at;
        assert_eq!(delay, chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn manual_retry_requires_failed_with_budget() {
        let (store, _runner, executor) =
            setup(Err(ExecutionError::fatal("bad input")), wired()).await;
        let task = Task::new("wf-1", None, json!({}), 3, Utc::now());
        store.create_task(&task).await.unwrap();
        executor.run(&task.id, None).await.unwrap();

        let requeued = executor.retry(&task.id, Utc::now()).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.tries, 0);
        assert!(requeued.error.is_none());
        assert!(requeued.started_at.is_none());

        let err = executor.retry(&task.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        let logs = store.list_logs(&task.id).await.unwrap();
        assert!(logs.iter().any(|l| l.message.contains("bad input") && l.level == LogLevel::Info));
    }

    /// Simulates the reaper requeueing `worker-a` and `worker-b` restarting
    /// the task while the remote call is still in flight
    struct TakeoverRunner {
        store: Arc<SqliteStore>,
    }

    #[async_trait]
    impl WorkflowRunner for TakeoverRunner {
        async fn execute(
            &self,
            _remote_workflow_id: &str,
            input: &Value,
        ) -> std::result::Result<Value, ExecutionError> {
            let id = input["id"].as_str().unwrap_or_default();
            self.store
                .requeue_worker_tasks("worker-a", Utc::now())
                .await
                .map_err(|e| ExecutionError::fatal(e.to_string()))?;
            self.store
                .start(id, Some("worker-b"), Utc::now())
                .await
                .map_err(|e| ExecutionError::fatal(e.to_string()))?;

            if input["fail"] == json!(true) {
                Err(ExecutionError::retriable("late failure"))
            } else {
                Ok(json!({"late": true}))
            }
        }
    }

    #[tokio::test]
    async fn late_result_does_not_overwrite_a_takeover() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.save_workflow(&wired()).await.unwrap();
        let executor = TaskExecutor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(TakeoverRunner { store: store.clone() }),
            RetryPolicy::default(),
        );

        for fail in [false, true] {
            let mut task = Task::new("wf-1", None, json!({}), 3, Utc::now());
            task.input_data = json!({"id": task.id.clone(), "fail": fail});
            store.create_task(&task).await.unwrap();

            let outcome = executor.run(&task.id, Some("worker-a")).await.unwrap();
            assert!(matches!(outcome, RunOutcome::Skipped(_)), "fail={}", fail);

            let current = store.get_task(&task.id).await.unwrap().unwrap();
            assert_eq!(current.status, TaskStatus::Running);
            assert_eq!(current.worker_id.as_deref(), Some("worker-b"));
            assert_eq!(current.tries, 2);
            assert!(current.output_data.is_none());

            // Only the requeue was logged, not the stale attempt
            let logs = store.list_logs(&task.id).await.unwrap();
            assert_eq!(logs.len(), 1);
            assert_eq!(logs[0].level, LogLevel::Warning);
        }
    }

    #[tokio::test]
    async fn manual_retry_refuses_a_second_active_scheduled_task() {
        let (store, _runner, executor) = setup(Ok(json!({})), wired()).await;
        let mut failed = Task::new("wf-1", Some("s-1".to_string()), json!({}), 3, Utc::now());
        failed.status = TaskStatus::Failed;
        failed.tries = 1;
        failed.error = Some("timeout".to_string());
        store.create_task(&failed).await.unwrap();
        let pending = Task::new("wf-1", Some("s-1".to_string()), json!({}), 3, Utc::now());
        assert!(store.enqueue_single_flight(&pending).await.unwrap());

        let err = executor.retry(&failed.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::WorkflowBusy { ref workflow_id } if workflow_id == "wf-1"));

        let unchanged = store.get_task(&failed.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::Failed);
        assert_eq!(unchanged.tries, 1);
        assert_eq!(unchanged.error.as_deref(), Some("timeout"));
        assert!(store.list_logs(&failed.id).await.unwrap().is_empty());

        let filter = TaskFilter {
            workflow_id: Some("wf-1".to_string()),
            status: Some(TaskStatus::Pending),
            ..Default::default()
        };
        assert_eq!(store.list_tasks(&filter).await.unwrap().len(), 1);
    }

    /// Workflow lookup that lets another worker start the task first
    struct RacingWorkflows {
        store: Arc<SqliteStore>,
        task_id: String,
    }

    #[async_trait]
    impl WorkflowStore for RacingWorkflows {
        async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
            self.store.save_workflow(workflow).await
        }

        async fn get_workflow(&self, _id: &str) -> Result<Option<Workflow>> {
            self.store.start(&self.task_id, Some("w-other"), Utc::now()).await?;
            Ok(None)
        }

        async fn list_workflows(&self) -> Result<Vec<Workflow>> {
            self.store.list_workflows().await
        }

        async fn delete_workflow(&self, id: &str) -> Result<bool> {
            self.store.delete_workflow(id).await
        }
    }

    #[tokio::test]
    async fn pre_run_failure_leaves_a_started_task_alone() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let task = Task::new("wf-gone", None, json!({}), 3, Utc::now());
        store.create_task(&task).await.unwrap();

        let executor = TaskExecutor::new(
            store.clone(),
            Arc::new(RacingWorkflows {
                store: store.clone(),
                task_id: task.id.clone(),
            }),
            store.clone(),
            Arc::new(ScriptedRunner {
                calls: AtomicUsize::new(0),
                result: Ok(json!({})),
            }),
            RetryPolicy::default(),
        );

        let outcome = executor.run(&task.id, None).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Skipped(_)));

        let current = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Running);
        assert_eq!(current.worker_id.as_deref(), Some("w-other"));
        assert!(current.error.is_none());
        assert!(store.list_logs(&task.id).await.unwrap().is_empty());
    }
}
