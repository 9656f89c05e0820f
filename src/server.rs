/// Process setup and wiring
///
/// Builds the store, runner, registry, dispatcher and executor from
/// configuration, then runs one of the process roles: a worker (tick loop plus
/// the status endpoint) or the beat (schedule mirror). Operator commands
/// (`stop`, `status`) reuse the same wiring.

use crate::{
    config::{Config, DispatchMode},
    runtime::{
        BeatAdapter, CronBeatSubstrate, DueScheduleDispatcher, LoopSettings, TaskExecutor, TickSnapshot,
        WorkerLoop,
    },
    schedule::{NextRunCalculator, ScheduleService},
    store::SqliteStore,
    task::{RetryPolicy, TaskService},
    worker::{local_hostname, SysinfoProbe, WorkerHealth, WorkerRegistry},
    workflow::{HttpWorkflowRunner, WorkflowRunner},
};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Everything a flowcron process needs, wired from one config
pub struct Components {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub calculator: NextRunCalculator,
    pub registry: Arc<WorkerRegistry>,
    pub dispatcher: Arc<DueScheduleDispatcher>,
    pub executor: Arc<TaskExecutor>,
    pub schedules: ScheduleService,
    pub tasks: TaskService,
}

impl Components {
    /// Open the configured database and the HTTP runner
    pub async fn build(config: Config) -> Result<Self> {
        let path = config.database_path();
        let store = SqliteStore::connect(&path)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        let runner = HttpWorkflowRunner::new(&config.runner).context("Failed to build HTTP runner")?;
        Self::with_store(config, Arc::new(store), Arc::new(runner))
    }

    /// Wire components around an existing store and runner
    pub fn with_store(config: Config, store: Arc<SqliteStore>, runner: Arc<dyn WorkflowRunner>) -> Result<Self> {
        let tz = config.timezone()?;
        let calculator = NextRunCalculator::new(tz);
        let retry = RetryPolicy {
            max_retries: config.scheduler.max_retries,
            backoff_cap_secs: config.scheduler.backoff_cap_secs,
        };

        let registry = Arc::new(WorkerRegistry::new(
            store.clone(),
            store.clone(),
            Arc::new(SysinfoProbe::new(local_hostname())),
            chrono::Duration::seconds(i64::try_from(config.scheduler.heartbeat_timeout_secs).unwrap_or(i64::MAX)),
        ));
        let dispatcher = Arc::new(DueScheduleDispatcher::new(
            store.clone(),
            store.clone(),
            calculator,
            retry,
            config.scheduler.dispatch_batch,
        ));
        let executor = Arc::new(TaskExecutor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            runner,
            retry,
        ));
        let schedules = ScheduleService::new(store.clone(), store.clone(), calculator);
        let tasks = TaskService::new(store.clone(), store.clone(), Arc::clone(&executor));

        Ok(Self {
            config,
            store,
            calculator,
            registry,
            dispatcher,
            executor,
            schedules,
            tasks,
        })
    }
}

/// State behind the status endpoint
#[derive(Clone)]
pub struct StatusState {
    pub snapshot: Option<Arc<ArcSwap<TickSnapshot>>>,
    pub registry: Arc<WorkerRegistry>,
}

#[derive(Serialize)]
struct StatusBody {
    worker: Option<TickSnapshot>,
    workers: Vec<WorkerHealth>,
}

/// Router with `/healthz` and `/status`
pub fn create_app(state: StatusState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/status", get(status))
        .with_state(state)
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}

async fn status(State(state): State<StatusState>) -> Result<Json<StatusBody>, (StatusCode, String)> {
    let workers = state
        .registry
        .list(Utc::now())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let worker = state.snapshot.as_ref().map(|s| TickSnapshot::clone(&s.load()));
    Ok(Json(StatusBody { worker, workers }))
}

/// Initialize the tracing subscriber (RUST_LOG, default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("❌ Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("❌ Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("🛑 Shutdown signal received");
}

/// Flip the returned receiver to true on the first termination signal
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}

/// Run a worker process until it is signalled or stopped
pub async fn run_worker(mut config: Config, concurrency: Option<usize>) -> Result<()> {
    if let Some(concurrency) = concurrency {
        config.scheduler.concurrency = concurrency.max(1);
    }

    let components = Components::build(config).await?;
    let config = &components.config;

    let worker = components
        .registry
        .register(&local_hostname(), std::process::id(), Utc::now())
        .await
        .context("Failed to register worker")?;

    let worker_loop = WorkerLoop::new(
        worker.id.clone(),
        Arc::clone(&components.registry),
        Arc::clone(&components.dispatcher),
        Arc::clone(&components.executor),
        components.store.clone(),
        LoopSettings::from_config(&config.scheduler),
    );

    let shutdown = shutdown_channel();

    // The status endpoint is optional; several workers on one host share the port
    let app = create_app(StatusState {
        snapshot: Some(worker_loop.snapshot()),
        registry: Arc::clone(&components.registry),
    });
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            tracing::info!("📡 Status endpoint listening on http://{}", bind_addr);
            let mut server_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let serve = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                });
                if let Err(e) = serve.await {
                    tracing::error!("❌ Status endpoint failed: {}", e);
                }
            });
        }
        Err(e) => tracing::warn!("⚠️ Status endpoint disabled ({}): {}", bind_addr, e),
    }

    if config.scheduler.dispatch_mode == DispatchMode::Beat {
        tracing::info!("🥁 Beat dispatch mode: this worker only executes tasks");
    }

    worker_loop.run(shutdown).await?;
    Ok(())
}

/// Run the beat process: mirror schedules into tokio-cron-scheduler
pub async fn run_beat(config: Config) -> Result<()> {
    let components = Components::build(config).await?;

    let substrate = Arc::new(CronBeatSubstrate::new().await.context("Failed to create beat scheduler")?);
    let adapter = BeatAdapter::new(
        components.store.clone(),
        Arc::clone(&components.dispatcher),
        substrate.clone(),
        components.calculator,
    );

    substrate.start().await?;
    let period = Duration::from_secs(components.config.scheduler.beat_refresh_secs.max(1));
    adapter.run(period, shutdown_channel()).await;
    substrate.shutdown().await?;
    Ok(())
}

/// Mark a worker stopped and signal it when it runs on this host
pub async fn stop_worker(config: Config, worker_id: &str) -> Result<()> {
    let components = Components::build(config).await?;
    let worker = components.registry.stop(worker_id, Utc::now()).await?;
    println!("Worker {} ({}:{}) stopped", worker.id, worker.hostname, worker.pid);
    Ok(())
}

/// Print a table of registered workers
pub async fn print_status(config: Config) -> Result<()> {
    let components = Components::build(config).await?;
    let now = Utc::now();
    let workers = components.registry.list(now).await?;

    if workers.is_empty() {
        println!("No workers registered");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:>7}  {:<8}  {:>9}  {:<7}  {}",
        "ID", "HOST", "PID", "STATUS", "HEARTBEAT", "ALIVE", "CURRENT TASK"
    );
    for health in workers {
        let w = &health.worker;
        let alive = match (health.stale, health.process_alive) {
            (_, Some(false)) => "dead",
            (true, _) => "stale",
            (false, _) => "yes",
        };
        println!(
            "{:<36}  {:<20}  {:>7}  {:<8}  {:>8}s  {:<7}  {}",
            w.id,
            w.hostname,
            w.pid,
            w.status.as_str(),
            w.heartbeat_age(now).num_seconds(),
            alive,
            w.current_task_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
