/// Task and task log definitions
///
/// A task is one trackable execution attempt of a workflow. Its lifecycle is
/// pending -> running -> {completed, pending (automatic retry), failed}.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted task row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub workflow_id: String,
    /// Set when the task was produced by schedule dispatch
    pub schedule_id: Option<String>,
    pub status: TaskStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    /// Latest failure message
    pub error: Option<String>,
    /// Attempts started so far; never exceeds max_retries
    pub tries: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Worker that currently owns (or last owned) the task
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task
    pub fn new(
        workflow_id: impl Into<String>,
        schedule_id: Option<String>,
        input_data: Value,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            schedule_id,
            status: TaskStatus::Pending,
            input_data,
            output_data: None,
            error: None,
            tries: 0,
            max_retries,
            next_retry_at: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.tries >= self.max_retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Append-only audit entry for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: String,
    pub task_id: String,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl TaskLog {
    pub fn new(
        task_id: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            level,
            message: message.into(),
            created_at: now,
        }
    }
}

/// Optional filters for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub workflow_id: Option<String>,
    pub schedule_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub limit: Option<u32>,
}
