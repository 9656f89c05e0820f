/// Configuration management for flowcron workers
///
/// Handles database location, tick timing, retry policy, the remote runner
/// endpoint, and the status server. Values come from `FLOWCRON_*` environment
/// variables with container-friendly defaults.

use crate::error::{Error, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Scheduling and worker loop configuration
    pub scheduler: SchedulerConfig,
    /// Remote workflow engine endpoint
    pub runner: RunnerConfig,
    /// Status/health HTTP endpoint
    pub server: ServerConfig,
}

/// SQLite database location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the database file (default: "data")
    pub data_dir: String,
    /// Database file name inside `data_dir`
    pub file_name: String,
}

/// How due schedules become tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Every worker tick polls for due schedules
    Poll,
    /// A beat process mirrors schedules into tokio-cron-scheduler; workers only execute
    Beat,
}

impl FromStr for DispatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "poll" => Ok(DispatchMode::Poll),
            "beat" => Ok(DispatchMode::Beat),
            other => Err(Error::Config {
                message: format!("unknown dispatch mode '{}' (expected poll or beat)", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA zone used to interpret cron fields and naive oneshot instants
    pub timezone: String,
    /// Worker tick period in seconds
    pub tick_secs: u64,
    /// A worker whose heartbeat is older than this is considered stale
    pub heartbeat_timeout_secs: u64,
    /// Tasks executed concurrently within one tick
    pub concurrency: usize,
    /// Upper bound on due schedules fetched per tick
    pub dispatch_batch: u32,
    pub dispatch_mode: DispatchMode,
    /// Default max_retries for newly created tasks
    pub max_retries: u32,
    /// Cap for the exponential retry backoff
    pub backoff_cap_secs: u64,
    /// Beat mirror refresh period in seconds
    pub beat_refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Base URL of the remote workflow engine
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                data_dir: "data".to_string(),
                file_name: "flowcron.db".to_string(),
            },
            scheduler: SchedulerConfig {
                timezone: "UTC".to_string(),
                tick_secs: 10,
                heartbeat_timeout_secs: 60,
                concurrency: 1,
                dispatch_batch: 100,
                dispatch_mode: DispatchMode::Poll,
                max_retries: 3,
                backoff_cap_secs: 300,
                beat_refresh_secs: 15,
            },
            runner: RunnerConfig {
                base_url: "http://127.0.0.1:7860".to_string(),
                api_key: None,
                timeout_secs: 300,
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3005,
            },
        }
    }
}

impl Config {
    /// Build configuration from `FLOWCRON_*` environment variables
    ///
    /// Unset variables keep their defaults. Unparseable numbers fall back to the
    /// default; an unknown time zone or dispatch mode is an error.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let config = Self {
            database: DatabaseConfig {
                data_dir: env_or("FLOWCRON_DATA_DIR", defaults.database.data_dir),
                file_name: env_or("FLOWCRON_DB_FILE", defaults.database.file_name),
            },
            scheduler: SchedulerConfig {
                timezone: env_or("FLOWCRON_TIMEZONE", defaults.scheduler.timezone),
                tick_secs: env_parse("FLOWCRON_TICK_SECS", defaults.scheduler.tick_secs),
                heartbeat_timeout_secs: env_parse(
                    "FLOWCRON_HEARTBEAT_TIMEOUT_SECS",
                    defaults.scheduler.heartbeat_timeout_secs,
                ),
                concurrency: env_parse("FLOWCRON_CONCURRENCY", defaults.scheduler.concurrency),
                dispatch_batch: env_parse(
                    "FLOWCRON_DISPATCH_BATCH",
                    defaults.scheduler.dispatch_batch,
                ),
                dispatch_mode: match std::env::var("FLOWCRON_DISPATCH_MODE") {
                    Ok(mode) => mode.parse()?,
                    Err(_) => defaults.scheduler.dispatch_mode,
                },
                max_retries: env_parse("FLOWCRON_MAX_RETRIES", defaults.scheduler.max_retries),
                backoff_cap_secs: env_parse(
                    "FLOWCRON_BACKOFF_CAP_SECS",
                    defaults.scheduler.backoff_cap_secs,
                ),
                beat_refresh_secs: env_parse(
                    "FLOWCRON_BEAT_REFRESH_SECS",
                    defaults.scheduler.beat_refresh_secs,
                ),
            },
            runner: RunnerConfig {
                base_url: env_or("FLOWCRON_RUNNER_URL", defaults.runner.base_url),
                api_key: std::env::var("FLOWCRON_RUNNER_API_KEY").ok(),
                timeout_secs: env_parse(
                    "FLOWCRON_RUNNER_TIMEOUT_SECS",
                    defaults.runner.timeout_secs,
                ),
            },
            server: ServerConfig {
                host: env_or("FLOWCRON_STATUS_HOST", defaults.server.host),
                port: env_parse("FLOWCRON_STATUS_PORT", defaults.server.port),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run safely with
    ///
    /// A worker heartbeats once per tick, also while its tasks are running, so
    /// the heartbeat timeout must cover at least two ticks or peers will reap
    /// a live worker between beats.
    pub fn validate(&self) -> Result<()> {
        // Fail fast on a bad zone instead of at the first recompute
        self.timezone()?;

        let tick = self.scheduler.tick_secs.max(1);
        if self.scheduler.heartbeat_timeout_secs <= tick.saturating_mul(2) {
            return Err(Error::Config {
                message: format!(
                    "heartbeat timeout ({}s) must be more than twice the tick interval ({}s)",
                    self.scheduler.heartbeat_timeout_secs, tick
                ),
            });
        }
        Ok(())
    }

    /// Parsed scheduling time zone
    pub fn timezone(&self) -> Result<Tz> {
        self.scheduler.timezone.parse::<Tz>().map_err(|e| Error::Config {
            message: format!("invalid timezone '{}': {}", self.scheduler.timezone, e),
        })
    }

    /// Full path of the SQLite database file
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database.data_dir).join(&self.database.file_name)
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.timezone().unwrap(), chrono_tz::UTC);
        assert_eq!(config.scheduler.tick_secs, 10);
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.database_path(), PathBuf::from("data").join("flowcron.db"));
    }

    #[test]
    fn rejects_unknown_timezone() {
        let mut config = Config::default();
        config.scheduler.timezone = "Mars/Olympus_Mons".to_string();
        assert!(matches!(config.timezone(), Err(Error::Config { .. })));
    }

    #[test]
    fn heartbeat_timeout_must_outlast_two_ticks() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.scheduler.tick_secs = 30;
        config.scheduler.heartbeat_timeout_secs = 60;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));

        config.scheduler.heartbeat_timeout_secs = 61;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_dispatch_mode() {
        assert_eq!("BEAT".parse::<DispatchMode>().unwrap(), DispatchMode::Beat);
        assert_eq!("poll".parse::<DispatchMode>().unwrap(), DispatchMode::Poll);
        assert!("push".parse::<DispatchMode>().is_err());
    }
}
