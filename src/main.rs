/// flowcron: workflow run scheduler
///
/// Entry point for the worker, beat and operator commands. Configuration comes
/// from `FLOWCRON_*` environment variables; a failing command exits non-zero
/// with the error message.

use clap::{Parser, Subcommand};
use flowcron::{config::Config, server};

#[derive(Parser)]
#[command(name = "flowcron", version, about = "Schedule and retry workflow runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker: dispatch due schedules (poll mode) and execute tasks
    Worker {
        /// Tasks executed concurrently per tick (overrides FLOWCRON_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Mirror schedules into the in-process cron scheduler (beat mode)
    Beat,
    /// Mark a worker stopped and signal it if it runs on this host
    Stop {
        worker_id: String,
    },
    /// List registered workers and their liveness
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    server::init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Worker { concurrency } => server::run_worker(config, concurrency).await,
        Command::Beat => server::run_beat(config).await,
        Command::Stop { worker_id } => server::stop_worker(config, &worker_id).await,
        Command::Status => server::print_status(config).await,
    }
}
