/// flowcron: scheduling and execution engine for remote workflow runs
///
/// Schedules (interval, cron, oneshot) become tasks, tasks are executed against
/// a remote workflow engine with exponential-backoff retries, and worker
/// processes coordinate through a shared SQLite store.

// Environment-driven configuration
pub mod config;

// Error taxonomy
pub mod error;

// Schedule rows, next-run computation, schedule operations
pub mod schedule;

// Task rows, retry policy, task operations
pub mod task;

// Workflow metadata and the remote runner
pub mod workflow;

// Worker rows, heartbeats and the reaper
pub mod worker;

// Persistence contracts and the SQLite implementation
pub mod store;

// Dispatcher, executor, worker loop and beat adapter
pub mod runtime;

// Process wiring, status endpoint and signal handling
pub mod server;

// Re-export commonly used types for external consumers
pub use config::Config;
pub use error::{Error, ExecutionError, Result};
pub use runtime::{BeatAdapter, DueScheduleDispatcher, TaskExecutor, WorkerLoop};
pub use schedule::{NextRunCalculator, Schedule, ScheduleService, ScheduleStatus, ScheduleType};
pub use store::SqliteStore;
pub use task::{Task, TaskService, TaskStatus};
pub use worker::{Worker, WorkerRegistry};
pub use workflow::{Workflow, WorkflowRunner};
