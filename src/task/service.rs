/// On-demand task operations
///
/// Tasks created here carry no schedule_id and are not subject to the
/// single-flight guard.

use crate::error::{Error, Result};
use crate::runtime::executor::{RunOutcome, TaskExecutor};
use crate::store::{TaskStore, WorkflowStore};
use crate::task::types::{Task, TaskFilter, TaskLog};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// A task together with its full log history
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task: Task,
    pub logs: Vec<TaskLog>,
}

pub struct TaskService {
    tasks: Arc<dyn TaskStore>,
    workflows: Arc<dyn WorkflowStore>,
    executor: Arc<TaskExecutor>,
}

impl TaskService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        workflows: Arc<dyn WorkflowStore>,
        executor: Arc<TaskExecutor>,
    ) -> Self {
        Self {
            tasks,
            workflows,
            executor,
        }
    }

    /// Queue a pending task for the next worker tick
    pub async fn run(&self, workflow_id: &str, input: Value, now: DateTime<Utc>) -> Result<Task> {
        if self.workflows.get_workflow(workflow_id).await?.is_none() {
            return Err(Error::WorkflowNotFound {
                id: workflow_id.to_string(),
            });
        }

        let max_retries = self.executor.retry_policy().max_retries;
        let task = Task::new(workflow_id, None, input, max_retries, now);
        self.tasks.create_task(&task).await?;

        tracing::info!("📥 Queued task {} for workflow {}", task.id, workflow_id);
        Ok(task)
    }

    /// Create a task and execute it in the calling task
    pub async fn run_now(&self, workflow_id: &str, input: Value) -> Result<RunOutcome> {
        let task = self.run(workflow_id, input, Utc::now()).await?;
        self.executor.run(&task.id, None).await
    }

    pub async fn retry(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task> {
        self.executor.retry(task_id, now).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.tasks.list_tasks(filter).await
    }

    pub async fn view(&self, task_id: &str) -> Result<TaskView> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound {
                id: task_id.to_string(),
            })?;
        let logs = self.tasks.list_logs(task_id).await?;
        Ok(TaskView { task, logs })
    }
}
