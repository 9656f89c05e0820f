/// Worker process definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    /// Heartbeats continue but no dispatch or execution happens
    Paused,
    /// Set by an operator stop or a graceful shutdown
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Paused => "paused",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "paused" => Ok(WorkerStatus::Paused),
            "stopped" => Ok(WorkerStatus::Stopped),
            other => Err(format!("unknown worker status '{}'", other)),
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub hostname: String,
    pub pid: u32,
    pub status: WorkerStatus,
    pub current_task_id: Option<String>,
    /// Opaque counters published by the worker loop
    pub stats: Value,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(hostname: impl Into<String>, pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hostname: hostname.into(),
            pid,
            status: WorkerStatus::Active,
            current_task_id: None,
            stats: serde_json::json!({}),
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

/// Counters a worker publishes with each heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub dispatched: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub reaped: u64,
}
