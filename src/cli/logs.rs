//! `flowctl logs`: renders a past run's `summary.json`.

use std::path::PathBuf;

use crate::model::RunSummary;

#[derive(clap::Args, Debug)]
pub struct LogsArgs {
    pub run_id: String,

    #[arg(long, default_value = "./.runs")]
    pub output_dir: PathBuf,

    #[arg(long)]
    pub json: bool,
}

pub fn run(args: LogsArgs) -> anyhow::Result<()> {
    let summary_path = args.output_dir.join(&args.run_id).join("summary.json");
    let contents = std::fs::read_to_string(&summary_path)
        .map_err(|e| anyhow::anyhow!("could not read {}: {e}", summary_path.display()))?;
    let summary: RunSummary = serde_json::from_str(&contents)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("run {} ({} -> {})", summary.run_id, summary.started_at, summary.finished_at);
    let mut step_ids: Vec<&String> = summary.steps.keys().collect();
    step_ids.sort();
    for id in step_ids {
        let s = &summary.steps[id];
        println!("  {id}: ok={} fail={} p50={:.1}ms p95={:.1}ms", s.ok, s.fail, s.p50_ms, s.p95_ms);
    }
    if !summary.failures.is_empty() {
        println!("failures:");
        for (id, failure) in &summary.failures {
            println!("  {id}: fatal={} {}", failure.fatal, failure.error);
        }
    }
    Ok(())
}
