/// Task layer
///
/// Task and log entities, the automatic retry policy, and on-demand task operations.

pub mod types;
pub mod retry;
pub mod service;

pub use retry::RetryPolicy;
pub use service::{TaskService, TaskView};
pub use types::{LogLevel, Task, TaskFilter, TaskLog, TaskStatus};
