/// Scheduling runtime
///
/// This module turns schedules into executed tasks:
/// - Due schedule dispatch with compare-and-swap claims and single-flight
/// - The task execution and retry state machine
/// - The per-worker tick loop
/// - Optional beat mode mirroring schedules into tokio-cron-scheduler

// Due schedules -> pending tasks
pub mod dispatcher;

// pending -> running -> completed / retry / failed
pub mod executor;

// Heartbeat, reap, dispatch, execute
pub mod worker_loop;

// Schedule mirror for the tokio-cron-scheduler substrate
pub mod beat;

pub use beat::{BeatAdapter, BeatEntry, BeatHandler, BeatSubstrate, BeatTrigger, CronBeatSubstrate, DispatchOnFire, EntryHandle};
pub use dispatcher::{DispatchOutcome, DispatchReport, DueScheduleDispatcher};
pub use executor::{RunOutcome, TaskExecutor};
pub use worker_loop::{LoopSettings, TickControl, TickSnapshot, WorkerLoop};
