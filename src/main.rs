//! `flowctl` — loads a flow document, plans its DAG, and drives it to
//! completion with per-step retries, hard timeouts, and a JSONL event trail.
//!
//! Subcommands: `run`, `validate`, `diff`, `logs`, `stats`, `gc`.

mod agents;
mod cli;
mod config;
mod context;
mod errors;
mod executors;
mod jsonl;
mod limits;
mod loader;
mod model;
mod planner;
mod redactor;
mod retry;
mod router;
mod runner;
mod skills;
mod telemetry;
mod validation;

use clap::{Parser, Subcommand};
use tracing::error;

use cli::{diff, gc, logs, run, stats, validate};
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "flowctl")]
#[command(about = "Multi-agent flow runner: DAG execution, MCP routing, skill guarding", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate, plan, and execute a flow.
    Run(run::RunArgs),
    /// Validate a flow file without executing it.
    Validate(validate::ValidateArgs),
    /// Compare two flow files and classify the changes.
    Diff(diff::DiffArgs),
    /// Render a past run's summary.
    Logs(logs::LogsArgs),
    /// Aggregate metrics across past runs.
    Stats(stats::StatsArgs),
    /// Prune old run directories.
    Gc(gc::GcArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let telemetry_config = TelemetryConfig::from_env();
    if let Err(e) = init_telemetry(telemetry_config) {
        eprintln!("warning: failed to initialize telemetry: {e}");
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    let result = match cli.command {
        Commands::Run(args) => run::run(args).await,
        Commands::Validate(args) => validate::run(args),
        Commands::Diff(args) => diff::run(args),
        Commands::Logs(args) => logs::run(args),
        Commands::Stats(args) => stats::run(args),
        Commands::Gc(args) => gc::run(args),
    };

    shutdown_telemetry();

    if let Err(e) = result {
        error!(error = %e, "command failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
