/// Worker processes
///
/// Worker rows, heartbeats, liveness probing and dead-worker recovery.

pub mod types;

// Registration, heartbeats and the reaper
pub mod registry;

pub use registry::{local_hostname, ProcessProbe, ReapReport, SysinfoProbe, WorkerHealth, WorkerRegistry};
pub use types::{Worker, WorkerStats, WorkerStatus};
