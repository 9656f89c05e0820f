/// Error taxonomy for the scheduling core
///
/// Creation-time validation errors propagate to the caller. Dispatch-time and
/// execution-time errors are caught by the worker loop, logged, and never abort a tick.

use thiserror::Error;

/// Result type for flowcron operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a [`crate::workflow::WorkflowRunner`].
///
/// `retriable = false` marks failures that retrying cannot fix (bad request,
/// unknown remote flow). Those go straight to the terminal `failed` state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    pub retriable: bool,
}

impl ExecutionError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Bad interval/cron/oneshot string
    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidScheduleExpression { expression: String, reason: String },

    #[error("Schedule '{id}' not found")]
    ScheduleNotFound { id: String },

    #[error("Workflow '{id}' not found")]
    WorkflowNotFound { id: String },

    #[error("Task '{id}' not found")]
    TaskNotFound { id: String },

    #[error("Worker '{id}' not found")]
    WorkerNotFound { id: String },

    /// Workflow lacks its input or output component; never retried automatically
    #[error("Workflow '{workflow_id}' has no {missing} component configured")]
    ComponentNotConfigured { workflow_id: String, missing: String },

    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionError),

    /// Raised only by an explicit manual retry of an exhausted task
    #[error("Task '{task_id}' exhausted its retries ({tries}/{max_retries})")]
    MaxRetriesExceeded {
        task_id: String,
        tries: u32,
        max_retries: u32,
    },

    /// Requeueing would give the workflow a second active scheduled task
    #[error("Workflow '{workflow_id}' already has a pending or running scheduled task")]
    WorkflowBusy { workflow_id: String },

    #[error("Invalid {entity} state transition from {from} to {to}")]
    InvalidStateTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// Persistence failure; the surrounding transaction is rolled back
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Corrupt {entity} row: {message}")]
    CorruptRow { entity: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Beat substrate error: {0}")]
    Substrate(String),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl Error {
    pub(crate) fn invalid_expression(expression: &str, reason: impl Into<String>) -> Self {
        Error::InvalidScheduleExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(entity: &str, message: impl Into<String>) -> Self {
        Error::CorruptRow {
            entity: entity.to_string(),
            message: message.into(),
        }
    }
}

impl From<tokio_cron_scheduler::JobSchedulerError> for Error {
    fn from(e: tokio_cron_scheduler::JobSchedulerError) -> Self {
        Error::Substrate(e.to_string())
    }
}
