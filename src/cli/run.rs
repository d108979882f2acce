//! `flowctl run`: load, validate, plan, and execute a flow.

use std::path::PathBuf;

use tracing::{error, info};

use crate::loader::load_flow_from_file;
use crate::runner::FlowRunner;
use crate::validation::validate_flow;

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Path to the flow file (YAML or JSON).
    pub flow: PathBuf,

    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Comma-separated step ids; only these and their transitive
    /// dependencies run.
    #[arg(long, value_delimiter = ',')]
    pub only: Option<Vec<String>>,

    /// Treat every step up to and including this id as already done.
    #[arg(long)]
    pub continue_from: Option<String>,

    /// Print the execution plan without running anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Skip schema validation and flush every log line immediately.
    #[arg(long)]
    pub dev_fast: bool,

    /// Emit a one-line progress update per step transition.
    #[arg(long)]
    pub progress: bool,

    /// Currently a no-op flag retained for forward compatibility with the
    /// perf-tracing story described in the design notes; no span emission is
    /// wired to it yet.
    #[arg(long)]
    pub trace_perf: bool,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let flow = load_flow_from_file(&args.flow, args.dev_fast)?;
    validate_flow(&flow)?;

    let runner = FlowRunner::new(
        flow,
        &args.flow,
        args.run_id,
        args.output_dir,
        None,
        args.only.as_deref(),
        args.continue_from.as_deref(),
        args.dev_fast,
    )?;

    if args.dry_run {
        for id in runner.dry_run_order() {
            println!("{id}");
        }
        return Ok(());
    }

    if args.progress {
        info!(run_id = runner.run_id(), "starting run");
    }

    match runner.run().await {
        Ok(run_id) => {
            println!("run {run_id} complete ({})", runner.run_dir().display());
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "run failed");
            Err(e.into())
        }
    }
}
