//! `flowctl stats`: aggregates `summary.json`/`mcp_calls.jsonl` across past
//! runs.
//!
//! Uses linear-interpolation percentiles, not the nearest-rank algorithm
//! [`crate::model::compute_percentile`] uses for a single run's
//! `StepSummary` — aggregating samples gathered *across* runs calls for the
//! smoother estimate; the two are intentionally different algorithms.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::model::{McpAuditRecord, RunSummary};

#[derive(clap::Args, Debug)]
pub struct StatsArgs {
    #[arg(long, default_value = "./.runs")]
    pub runs_dir: PathBuf,

    #[arg(long)]
    pub last: Option<usize>,

    #[arg(long, value_enum, default_value = "step")]
    pub group_by: GroupBy,

    #[arg(long)]
    pub json: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum GroupBy {
    Step,
    Model,
}

#[derive(Debug, Serialize, Default)]
struct Aggregate {
    ok: u64,
    fail: u64,
    samples: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct GroupStats {
    key: String,
    ok: u64,
    fail: u64,
    p50_ms: f64,
    p95_ms: f64,
    count: usize,
}

/// Linear-interpolation percentile: distinct from
/// [`crate::model::compute_percentile`]'s nearest-rank algorithm.
pub fn interpolated_percentile(samples: &[f64], percentile: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut ordered = samples.to_vec();
    ordered.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if ordered.len() == 1 {
        return ordered[0];
    }
    let rank = (percentile / 100.0) * (ordered.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return ordered[lower];
    }
    let weight = rank - lower as f64;
    ordered[lower] + (ordered[upper] - ordered[lower]) * weight
}

pub fn run(args: StatsArgs) -> anyhow::Result<()> {
    let run_dirs = collect_run_dirs(&args.runs_dir, args.last)?;

    let groups = match args.group_by {
        GroupBy::Step => aggregate_by_step(&run_dirs)?,
        GroupBy::Model => aggregate_by_model(&run_dirs)?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    for g in &groups {
        println!(
            "{}: ok={} fail={} p50={:.1}ms p95={:.1}ms (n={})",
            g.key, g.ok, g.fail, g.p50_ms, g.p95_ms, g.count
        );
    }
    Ok(())
}

fn collect_run_dirs(runs_dir: &std::path::Path, last: Option<usize>) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    let read_dir = match std::fs::read_dir(runs_dir) {
        Ok(rd) => rd,
        Err(_) => return Ok(Vec::new()),
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                entries.push((modified, path));
            }
        }
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    let mut dirs: Vec<PathBuf> = entries.into_iter().map(|(_, p)| p).collect();
    if let Some(n) = last {
        dirs.truncate(n);
    }
    Ok(dirs)
}

fn aggregate_by_step(run_dirs: &[PathBuf]) -> anyhow::Result<Vec<GroupStats>> {
    let mut groups: HashMap<String, Aggregate> = HashMap::new();

    for dir in run_dirs {
        let summary_path = dir.join("summary.json");
        let Ok(contents) = std::fs::read_to_string(&summary_path) else {
            continue;
        };
        let Ok(summary) = serde_json::from_str::<RunSummary>(&contents) else {
            continue;
        };
        for (step_id, step) in summary.steps {
            let entry = groups.entry(step_id).or_default();
            entry.ok += step.ok;
            entry.fail += step.fail;
            entry.samples.push(step.p50_ms);
            entry.samples.push(step.p95_ms);
        }
    }

    Ok(finalize(groups))
}

fn aggregate_by_model(run_dirs: &[PathBuf]) -> anyhow::Result<Vec<GroupStats>> {
    let mut groups: HashMap<String, Aggregate> = HashMap::new();

    for dir in run_dirs {
        let audit_path = dir.join("mcp_calls.jsonl");
        let Ok(contents) = std::fs::read_to_string(&audit_path) else {
            continue;
        };
        for line in contents.lines() {
            let Ok(record) = serde_json::from_str::<McpAuditRecord>(line) else {
                continue;
            };
            let entry = groups.entry(record.model.clone()).or_default();
            if record.status == "ok" {
                entry.ok += 1;
            } else {
                entry.fail += 1;
            }
            entry.samples.push(record.latency_ms);
        }
    }

    Ok(finalize(groups))
}

fn finalize(groups: HashMap<String, Aggregate>) -> Vec<GroupStats> {
    let mut out: Vec<GroupStats> = groups
        .into_iter()
        .map(|(key, agg)| GroupStats {
            p50_ms: interpolated_percentile(&agg.samples, 50.0),
            p95_ms: interpolated_percentile(&agg.samples, 95.0),
            count: agg.samples.len(),
            ok: agg.ok,
            fail: agg.fail,
            key,
        })
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}
