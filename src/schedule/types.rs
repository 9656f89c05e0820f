/// Schedule type definitions
///
/// A schedule is a rule describing when, and with which parameters, a
/// workflow should run. It is persisted in the `schedules` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// How the next fire time is derived from the expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    /// `"<n><unit>"` with unit in s/m/h/d/w, e.g. `"30m"`
    Interval,
    /// 5-field Unix cron, e.g. `"0 8 * * *"`
    Cron,
    /// ISO-8601 instant or the literal `"now"`; fires at most once
    Oneshot,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Interval => "interval",
            ScheduleType::Cron => "cron",
            ScheduleType::Oneshot => "oneshot",
        }
    }

    /// Interval and cron schedules are recomputed after every fire
    pub fn is_repeating(&self) -> bool {
        !matches!(self, ScheduleType::Oneshot)
    }
}

impl FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(ScheduleType::Interval),
            "cron" => Ok(ScheduleType::Cron),
            "oneshot" => Ok(ScheduleType::Oneshot),
            other => Err(format!("unknown schedule type '{}'", other)),
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Stopped,
    /// Terminal state of a oneshot that has fired
    Completed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
            ScheduleStatus::Stopped => "stopped",
            ScheduleStatus::Completed => "completed",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ScheduleStatus::Active),
            "paused" => Ok(ScheduleStatus::Paused),
            "stopped" => Ok(ScheduleStatus::Stopped),
            "completed" => Ok(ScheduleStatus::Completed),
            other => Err(format!("unknown schedule status '{}'", other)),
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted schedule row
///
/// Timestamps are instants; the configured zone only matters when computing
/// the next fire time (cron fields and naive oneshot instants).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub workflow_id: String,
    pub schedule_type: ScheduleType,
    pub expression: String,
    /// Opaque payload copied into each task's input_data
    pub params: Value,
    pub status: ScheduleStatus,
    /// Always populated; for active schedules this is the next fire time
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Create a new active schedule
    pub fn new(
        workflow_id: impl Into<String>,
        schedule_type: ScheduleType,
        expression: impl Into<String>,
        params: Value,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            schedule_type,
            expression: expression.into(),
            params,
            status: ScheduleStatus::Active,
            next_run_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Active && self.next_run_at <= now
    }
}

/// Optional filters for listing schedules
#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub workflow_id: Option<String>,
    pub status: Option<ScheduleStatus>,
}
