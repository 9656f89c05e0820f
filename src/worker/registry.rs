/// Worker registration and liveness
///
/// Every worker process owns one row in `workers`. The row's heartbeat is
/// refreshed each tick; a worker is dead when its heartbeat is older than the
/// timeout AND its process is gone. The reaper hands the running tasks of dead
/// workers back to the queue.

use crate::error::{Error, Result};
use crate::store::{TaskStore, WorkerStore};
use crate::worker::types::{Worker, WorkerStats, WorkerStatus};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

/// OS process inspection
pub trait ProcessProbe: Send + Sync {
    /// `Some(alive)` when the process can be inspected from here, `None` otherwise
    fn is_alive(&self, hostname: &str, pid: u32) -> Option<bool>;

    /// Ask a process to terminate; returns false when it could not be signalled
    fn terminate(&self, hostname: &str, pid: u32) -> bool;
}

/// Probe backed by sysinfo; only processes on this host are inspected
#[derive(Debug, Clone)]
pub struct SysinfoProbe {
    hostname: String,
}

impl SysinfoProbe {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    fn refreshed(pid: Pid) -> System {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
    }
}

impl ProcessProbe for SysinfoProbe {
    fn is_alive(&self, hostname: &str, pid: u32) -> Option<bool> {
        if hostname != self.hostname {
            return None;
        }
        let pid = Pid::from_u32(pid);
        Some(Self::refreshed(pid).process(pid).is_some())
    }

    fn terminate(&self, hostname: &str, pid: u32) -> bool {
        if hostname != self.hostname {
            return false;
        }
        let pid = Pid::from_u32(pid);
        let system = Self::refreshed(pid);
        match system.process(pid) {
            Some(process) => process.kill_with(Signal::Term).unwrap_or(false),
            None => false,
        }
    }
}

/// Name of this machine as recorded on worker rows
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Worker row plus what the registry can tell about it right now
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    #[serde(flatten)]
    pub worker: Worker,
    pub stale: bool,
    /// None when the process lives on another host
    pub process_alive: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub workers: u64,
    pub tasks: u64,
}

pub struct WorkerRegistry {
    workers: Arc<dyn WorkerStore>,
    tasks: Arc<dyn TaskStore>,
    probe: Arc<dyn ProcessProbe>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(
        workers: Arc<dyn WorkerStore>,
        tasks: Arc<dyn TaskStore>,
        probe: Arc<dyn ProcessProbe>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            workers,
            tasks,
            probe,
            heartbeat_timeout,
        }
    }

    pub async fn register(&self, hostname: &str, pid: u32, now: DateTime<Utc>) -> Result<Worker> {
        let worker = Worker::new(hostname, pid, now);
        self.workers.insert_worker(&worker).await?;
        tracing::info!("👷 Registered worker {} ({}:{})", worker.id, hostname, pid);
        Ok(worker)
    }

    /// Refresh the heartbeat and publish stats; returns the stored status so
    /// the loop can honour an operator pause or stop
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        stats: &WorkerStats,
        now: DateTime<Utc>,
    ) -> Result<WorkerStatus> {
        let stats = serde_json::to_value(stats)?;
        self.workers
            .heartbeat(worker_id, &stats, now)
            .await?
            .ok_or_else(|| Error::WorkerNotFound {
                id: worker_id.to_string(),
            })
    }

    /// Graceful shutdown: the row stays, marked stopped
    pub async fn deregister(&self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.workers.set_current_task(worker_id, None, now).await?;
        self.workers
            .set_worker_status(worker_id, WorkerStatus::Stopped, now)
            .await?;
        tracing::info!("👋 Worker {} deregistered", worker_id);
        Ok(())
    }

    /// Operator stop: mark the worker stopped and signal its process when it
    /// runs on this host. The loop also exits on its next heartbeat.
    pub async fn stop(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Worker> {
        let worker = self
            .workers
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| Error::WorkerNotFound {
                id: worker_id.to_string(),
            })?;

        self.workers
            .set_worker_status(worker_id, WorkerStatus::Stopped, now)
            .await?;
        if self.probe.terminate(&worker.hostname, worker.pid) {
            tracing::info!("📨 Sent SIGTERM to worker {} (pid {})", worker_id, worker.pid);
        } else {
            tracing::info!("⏹️ Worker {} marked stopped; it exits on its next heartbeat", worker_id);
        }

        Ok(Worker {
            status: WorkerStatus::Stopped,
            updated_at: now,
            ..worker
        })
    }

    pub async fn set_status(&self, worker_id: &str, status: WorkerStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.workers.set_worker_status(worker_id, status, now).await? {
            return Err(Error::WorkerNotFound {
                id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn list(&self, now: DateTime<Utc>) -> Result<Vec<WorkerHealth>> {
        let workers = self.workers.list_workers().await?;
        Ok(workers
            .into_iter()
            .map(|worker| WorkerHealth {
                stale: worker.heartbeat_age(now) > self.heartbeat_timeout,
                process_alive: self.probe.is_alive(&worker.hostname, worker.pid),
                worker,
            })
            .collect())
    }

    /// Requeue the running tasks of dead workers and delete their rows
    ///
    /// A stale worker whose process still exists is left alone. When the
    /// process cannot be inspected (another host) staleness alone decides.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = ReapReport::default();

        for worker in self.workers.stale_workers(now - self.heartbeat_timeout).await? {
            if self.probe.is_alive(&worker.hostname, worker.pid) == Some(true) {
                tracing::debug!("💤 Worker {} is stale but its process is alive", worker.id);
                continue;
            }

            let requeued = self.tasks.requeue_worker_tasks(&worker.id, now).await?;
            self.workers.delete_worker(&worker.id).await?;

            report.workers += 1;
            report.tasks += requeued;
            tracing::warn!(
                "🧹 Reaped dead worker {} ({}:{}), recovered {} task(s)",
                worker.id,
                worker.hostname,
                worker.pid,
                requeued
            );
        }

        Ok(report)
    }
}
