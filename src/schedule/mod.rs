/// Schedule layer
///
/// Schedule rows, next fire time computation, and the management operations
/// exposed to callers.

pub mod types;

// Expression parsing and next-run computation
pub mod calculator;

pub mod service;

pub use calculator::{normalize_cron, NextRunCalculator, OneShot, ScheduleSpec};
pub use service::ScheduleService;
pub use types::{Schedule, ScheduleFilter, ScheduleStatus, ScheduleType};
