/// Worker tick loop
///
/// One tick: heartbeat (honouring an operator pause/stop) -> reap dead workers
/// -> dispatch due schedules (poll mode only) -> run ready tasks with bounded
/// concurrency -> publish a snapshot. The heartbeat keeps going every tick
/// interval while tasks run, so a long remote call never makes a live worker
/// look dead. Ticks never overlap; a shutdown signal lets the current tick
/// finish before the worker deregisters.

use crate::config::{DispatchMode, SchedulerConfig};
use crate::error::{Error, Result};
use crate::runtime::dispatcher::{DispatchReport, DueScheduleDispatcher};
use crate::runtime::executor::{RunOutcome, TaskExecutor};
use crate::store::TaskStore;
use crate::worker::{WorkerRegistry, WorkerStats, WorkerStatus};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub tick: Duration,
    pub concurrency: usize,
    /// Ready tasks fetched per tick
    pub batch: u32,
    pub dispatch_mode: DispatchMode,
}

impl LoopSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            tick: Duration::from_secs(config.tick_secs.max(1)),
            concurrency: config.concurrency.max(1),
            batch: config.dispatch_batch,
            dispatch_mode: config.dispatch_mode,
        }
    }
}

/// State published after every tick for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct TickSnapshot {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub tick_at: Option<DateTime<Utc>>,
    pub stats: WorkerStats,
    pub last_dispatch: Option<DispatchReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

pub struct WorkerLoop {
    worker_id: String,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<DueScheduleDispatcher>,
    executor: Arc<TaskExecutor>,
    tasks: Arc<dyn TaskStore>,
    settings: LoopSettings,
    snapshot: Arc<ArcSwap<TickSnapshot>>,
}

impl WorkerLoop {
    pub fn new(
        worker_id: impl Into<String>,
        registry: Arc<WorkerRegistry>,
        dispatcher: Arc<DueScheduleDispatcher>,
        executor: Arc<TaskExecutor>,
        tasks: Arc<dyn TaskStore>,
        settings: LoopSettings,
    ) -> Self {
        let worker_id = worker_id.into();
        let snapshot = Arc::new(ArcSwap::from_pointee(TickSnapshot {
            worker_id: worker_id.clone(),
            status: WorkerStatus::Active,
            tick_at: None,
            stats: WorkerStats::default(),
            last_dispatch: None,
        }));

        Self {
            worker_id,
            registry,
            dispatcher,
            executor,
            tasks,
            settings,
            snapshot,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Shared handle to the latest tick snapshot
    pub fn snapshot(&self) -> Arc<ArcSwap<TickSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    /// Tick until shutdown or an operator stop, then deregister
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats> {
        tracing::info!(
            "🔁 Worker {} loop started (tick {:?}, concurrency {}, {:?} dispatch)",
            self.worker_id,
            self.settings.tick,
            self.settings.concurrency,
            self.settings.dispatch_mode
        );

        let mut stats = WorkerStats::default();
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.tick(&mut stats, Utc::now()).await {
                Ok(TickControl::Continue) => {}
                Ok(TickControl::Stop) => break,
                Err(e) => tracing::error!("❌ Worker {} tick failed: {}", self.worker_id, e),
            }
        }

        if let Err(e) = self.registry.deregister(&self.worker_id, Utc::now()).await {
            tracing::warn!("⚠️ Failed to deregister worker {}: {}", self.worker_id, e);
        }
        self.publish(WorkerStatus::Stopped, Utc::now(), &stats, None);
        tracing::info!("👋 Worker {} loop finished: {:?}", self.worker_id, stats);
        Ok(stats)
    }

    /// Run a single tick at `now`
    pub async fn tick(&self, stats: &mut WorkerStats, now: DateTime<Utc>) -> Result<TickControl> {
        stats.ticks += 1;

        let status = match self.registry.heartbeat(&self.worker_id, stats, now).await {
            Ok(status) => status,
            Err(Error::WorkerNotFound { .. }) => {
                tracing::warn!("⚠️ Worker {} row is gone, stopping", self.worker_id);
                return Ok(TickControl::Stop);
            }
            Err(e) => return Err(e),
        };

        match status {
            WorkerStatus::Stopped => {
                tracing::info!("⏹️ Worker {} was stopped by an operator", self.worker_id);
                return Ok(TickControl::Stop);
            }
            WorkerStatus::Paused => {
                tracing::debug!("⏸️ Worker {} is paused", self.worker_id);
                self.publish(status, now, stats, None);
                return Ok(TickControl::Continue);
            }
            WorkerStatus::Active => {}
        }

        match self.registry.reap(now).await {
            Ok(report) => stats.reaped += report.tasks,
            Err(e) => tracing::error!("❌ Reaper failed: {}", e),
        }

        let dispatch = if self.settings.dispatch_mode == DispatchMode::Poll {
            match self.dispatcher.dispatch(now).await {
                Ok(report) => {
                    stats.dispatched += report.dispatched;
                    Some(report)
                }
                Err(e) => {
                    tracing::error!("❌ Dispatch failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        match self.tasks.ready(now, self.settings.batch).await {
            Ok(ready) => self.execute(ready, stats).await,
            Err(e) => tracing::error!("❌ Failed to load ready tasks: {}", e),
        }

        self.publish(status, now, stats, dispatch);
        Ok(TickControl::Continue)
    }

    async fn execute(&self, ready: Vec<crate::task::Task>, stats: &mut WorkerStats) {
        if ready.is_empty() {
            return;
        }
        tracing::debug!("📋 Worker {} picked up {} ready task(s)", self.worker_id, ready.len());

        let succeeded = AtomicU64::new(0);
        let retried = AtomicU64::new(0);
        let failed = AtomicU64::new(0);
        let processed = AtomicU64::new(0);

        {
            let work = stream::iter(ready).for_each_concurrent(self.settings.concurrency, |task| {
                let (succeeded, retried, failed, processed) = (&succeeded, &retried, &failed, &processed);
                async move {
                    match self.executor.run(&task.id, Some(&self.worker_id)).await {
                        Ok(RunOutcome::Skipped(_)) => return,
                        Ok(RunOutcome::Completed(_)) => succeeded.fetch_add(1, Ordering::Relaxed),
                        Ok(RunOutcome::Retrying(_)) => retried.fetch_add(1, Ordering::Relaxed),
                        Ok(RunOutcome::Failed(_)) => failed.fetch_add(1, Ordering::Relaxed),
                        Err(e) => {
                            tracing::error!("❌ Task {} could not be executed: {}", task.id, e);
                            return;
                        }
                    };
                    processed.fetch_add(1, Ordering::Relaxed);
                }
            });

            let beat_stats = *stats;
            let keepalive = async {
                let mut beat = tokio::time::interval_at(Instant::now() + self.settings.tick, self.settings.tick);
                beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    beat.tick().await;
                    if let Err(e) = self.registry.heartbeat(&self.worker_id, &beat_stats, Utc::now()).await {
                        tracing::warn!("⚠️ Worker {} heartbeat during execution failed: {}", self.worker_id, e);
                    }
                }
            };

            // Both halves are polled together; the keepalive ends with the work
            tokio::select! {
                _ = work => {}
                _ = keepalive => {}
            }
        }

        stats.processed += processed.into_inner();
        stats.succeeded += succeeded.into_inner();
        stats.retried += retried.into_inner();
        stats.failed += failed.into_inner();
    }

    fn publish(
        &self,
        status: WorkerStatus,
        now: DateTime<Utc>,
        stats: &WorkerStats,
        last_dispatch: Option<DispatchReport>,
    ) {
        self.snapshot.store(Arc::new(TickSnapshot {
            worker_id: self.worker_id.clone(),
            status,
            tick_at: Some(now),
            stats: *stats,
            last_dispatch,
        }));
    }
}
