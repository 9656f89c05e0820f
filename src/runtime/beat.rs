/// Beat adapter: schedule mirroring into tokio-cron-scheduler
///
/// Instead of every worker polling for due schedules, one beat process keeps
/// the substrate's job table in sync with the `schedules` table. The store is
/// re-read on every refresh, so no change notification is needed:
/// - interval schedules become fixed-period jobs
/// - cron schedules become native cron jobs in the configured zone
/// - oneshots are reserved (marked completed) first, then added as delayed
///   one-shot jobs; only the instance that wins the reservation adds the job
///
/// Every fire goes through [`DueScheduleDispatcher::fire`], so single-flight,
/// the schedule compare-and-swap and task retries behave as in poll mode.

use crate::error::{Error, Result};
use crate::runtime::dispatcher::{DispatchOutcome, DueScheduleDispatcher};
use crate::schedule::{normalize_cron, NextRunCalculator, Schedule, ScheduleFilter, ScheduleSpec, ScheduleStatus};
use crate::store::ScheduleStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Handle of a job registered in the substrate
pub type EntryHandle = Uuid;

/// How long a fired oneshot stays in the mirror after its fire time
const ONESHOT_GRACE_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub enum BeatTrigger {
    Every(std::time::Duration),
    /// 6-field expression (seconds first) evaluated in `tz`
    Cron { expression: String, tz: Tz },
    /// Fire once after the delay
    Once(std::time::Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeatEntry {
    pub schedule_id: String,
    pub trigger: BeatTrigger,
}

/// Called by the substrate each time an entry fires
#[async_trait]
pub trait BeatHandler: Send + Sync {
    async fn on_fire(&self, schedule_id: &str);
}

/// Periodic-dispatch backend
#[async_trait]
pub trait BeatSubstrate: Send + Sync {
    async fn add(&self, entry: &BeatEntry, handler: Arc<dyn BeatHandler>) -> Result<EntryHandle>;
    async fn remove(&self, handle: EntryHandle) -> Result<()>;
}

/// Substrate backed by tokio-cron-scheduler's `JobScheduler`
pub struct CronBeatSubstrate {
    scheduler: RwLock<JobScheduler>,
}

impl CronBeatSubstrate {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: RwLock::new(scheduler),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let scheduler = self.scheduler.read().await;
        scheduler.start().await?;
        tracing::info!("⏰ Beat substrate started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        tracing::info!("⏹️ Beat substrate stopped");
        Ok(())
    }
}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn job_callback(
    schedule_id: String,
    handler: Arc<dyn BeatHandler>,
) -> impl FnMut(Uuid, JobScheduler) -> JobFuture + Send + Sync + 'static {
    move |_uuid, _l| {
        let schedule_id = schedule_id.clone();
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            tracing::debug!("🔔 Beat entry fired for schedule {}", schedule_id);
            handler.on_fire(&schedule_id).await;
        })
    }
}

#[async_trait]
impl BeatSubstrate for CronBeatSubstrate {
    async fn add(&self, entry: &BeatEntry, handler: Arc<dyn BeatHandler>) -> Result<EntryHandle> {
        let callback = job_callback(entry.schedule_id.clone(), handler);
        let job = match &entry.trigger {
            BeatTrigger::Every(period) => Job::new_repeated_async(*period, callback)?,
            BeatTrigger::Cron { expression, tz } => {
                Job::new_async_tz(expression.as_str(), *tz, callback)?
            }
            BeatTrigger::Once(delay) => Job::new_one_shot_async(*delay, callback)?,
        };

        let scheduler = self.scheduler.read().await;
        Ok(scheduler.add(job).await?)
    }

    async fn remove(&self, handle: EntryHandle) -> Result<()> {
        let scheduler = self.scheduler.read().await;
        scheduler.remove(&handle).await?;
        Ok(())
    }
}

/// Handler that routes substrate fires into the dispatcher
pub struct DispatchOnFire {
    dispatcher: Arc<DueScheduleDispatcher>,
}

impl DispatchOnFire {
    pub fn new(dispatcher: Arc<DueScheduleDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl BeatHandler for DispatchOnFire {
    async fn on_fire(&self, schedule_id: &str) {
        match self.dispatcher.fire(schedule_id, Utc::now()).await {
            Ok(DispatchOutcome::Dispatched) => {}
            Ok(outcome) => tracing::debug!("⏭️ Beat fire for {} ended as {:?}", schedule_id, outcome),
            Err(e) => tracing::error!("❌ Beat fire for schedule {} failed: {}", schedule_id, e),
        }
    }
}

struct MirrorEntry {
    fingerprint: String,
    /// A cron schedule with both day fields restricted needs two jobs
    handles: Vec<EntryHandle>,
    /// Set for oneshots; the entry is kept until this has passed
    fire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub added: u64,
    pub removed: u64,
    pub errors: u64,
}

pub struct BeatAdapter {
    schedules: Arc<dyn ScheduleStore>,
    dispatcher: Arc<DueScheduleDispatcher>,
    substrate: Arc<dyn BeatSubstrate>,
    handler: Arc<dyn BeatHandler>,
    calculator: NextRunCalculator,
    mirror: RwLock<HashMap<String, MirrorEntry>>,
}

impl BeatAdapter {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        dispatcher: Arc<DueScheduleDispatcher>,
        substrate: Arc<dyn BeatSubstrate>,
        calculator: NextRunCalculator,
    ) -> Self {
        let handler: Arc<dyn BeatHandler> = Arc::new(DispatchOnFire::new(Arc::clone(&dispatcher)));
        Self::with_handler(schedules, dispatcher, substrate, handler, calculator)
    }

    pub fn with_handler(
        schedules: Arc<dyn ScheduleStore>,
        dispatcher: Arc<DueScheduleDispatcher>,
        substrate: Arc<dyn BeatSubstrate>,
        handler: Arc<dyn BeatHandler>,
        calculator: NextRunCalculator,
    ) -> Self {
        Self {
            schedules,
            dispatcher,
            substrate,
            handler,
            calculator,
            mirror: RwLock::new(HashMap::new()),
        }
    }

    /// Number of schedules currently mirrored
    pub async fn mirrored(&self) -> usize {
        self.mirror.read().await.len()
    }

    /// Bring the substrate in line with the store
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<RefreshReport> {
        let schedules: HashMap<String, Schedule> = self
            .schedules
            .list_schedules(&ScheduleFilter::default())
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let mut report = RefreshReport::default();
        let mut mirror = self.mirror.write().await;

        // Prune
        let mut cancel = Vec::new();
        let mut forget = Vec::new();
        for (id, entry) in mirror.iter() {
            match (schedules.get(id), entry.fire_at) {
                (None, _) => cancel.push(id.clone()),
                (Some(_), Some(fire_at)) => {
                    if fire_at + Duration::seconds(ONESHOT_GRACE_SECS) < now {
                        forget.push(id.clone());
                    }
                }
                (Some(schedule), None) => {
                    if schedule.status != ScheduleStatus::Active || fingerprint(schedule) != entry.fingerprint {
                        cancel.push(id.clone());
                    }
                }
            }
        }
        for id in forget {
            mirror.remove(&id);
        }
        for id in cancel {
            if let Some(entry) = mirror.remove(&id) {
                match self.remove_handles(&entry.handles).await {
                    Ok(()) => {
                        report.removed += 1;
                        tracing::debug!("🛑 Removed beat entry for schedule {}", id);
                    }
                    Err(e) => {
                        report.errors += 1;
                        tracing::warn!("⚠️ Failed to remove beat entry for schedule {}: {}", id, e);
                    }
                }
            }
        }

        // Add
        for schedule in schedules.values() {
            if schedule.status != ScheduleStatus::Active || mirror.contains_key(&schedule.id) {
                continue;
            }
            match self.mirror_schedule(schedule, now).await {
                Ok(Some(entry)) => {
                    report.added += 1;
                    mirror.insert(schedule.id.clone(), entry);
                }
                Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!("❌ Cannot mirror schedule {}: {}", schedule.id, e);
                }
            }
        }

        if report.added > 0 || report.removed > 0 {
            tracing::info!(
                "🔄 Beat mirror refreshed: +{} -{} ({} entries)",
                report.added,
                report.removed,
                mirror.len()
            );
        }
        Ok(report)
    }

    async fn mirror_schedule(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<Option<MirrorEntry>> {
        let spec = self.calculator.parse(schedule.schedule_type, &schedule.expression)?;

        let (triggers, fire_at) = match spec {
            ScheduleSpec::Interval(step) => (vec![BeatTrigger::Every(to_std(step)?)], None),
            ScheduleSpec::Cron { expression, .. } => {
                let tz = self.calculator.timezone();
                let triggers = normalize_cron(&expression)?
                    .into_iter()
                    .map(|expression| BeatTrigger::Cron { expression, tz })
                    .collect();
                (triggers, None)
            }
            ScheduleSpec::OneShot(_) => {
                if !self.dispatcher.reserve_oneshot(schedule, now).await? {
                    return Ok(None);
                }
                let delay = (schedule.next_run_at - now).max(Duration::zero());
                (vec![BeatTrigger::Once(to_std(delay)?)], Some(schedule.next_run_at))
            }
        };

        let mut handles = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let entry = BeatEntry {
                schedule_id: schedule.id.clone(),
                trigger,
            };
            match self.substrate.add(&entry, Arc::clone(&self.handler)).await {
                Ok(handle) => {
                    tracing::debug!("📝 Mirrored schedule {} as {:?}", schedule.id, entry.trigger);
                    handles.push(handle);
                }
                Err(e) => {
                    if let Err(undo) = self.remove_handles(&handles).await {
                        tracing::warn!("⚠️ Failed to undo partial mirror of {}: {}", schedule.id, undo);
                    }
                    if fire_at.is_some() {
                        // Undo the reservation so the next refresh can try again
                        self.dispatcher.release_oneshot(schedule, now).await?;
                    }
                    return Err(e);
                }
            }
        }

        Ok(Some(MirrorEntry {
            fingerprint: fingerprint(schedule),
            handles,
            fire_at,
        }))
    }

    async fn remove_handles(&self, handles: &[EntryHandle]) -> Result<()> {
        for handle in handles {
            self.substrate.remove(*handle).await?;
        }
        Ok(())
    }

    /// Refresh every `period` until `shutdown` flips to true
    pub async fn run(&self, period: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh(Utc::now()).await {
                        tracing::error!("❌ Beat refresh failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("⏹️ Beat loop stopped");
    }
}

fn fingerprint(schedule: &Schedule) -> String {
    format!("{}|{}", schedule.schedule_type, schedule.expression)
}

fn to_std(d: Duration) -> Result<std::time::Duration> {
    d.to_std()
        .map_err(|e| Error::Substrate(format!("invalid beat duration: {}", e)))
}
