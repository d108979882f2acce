//! `flowctl diff`: compares two flow files and classifies each change as
//! breaking, a warning, or informational.
//!
//! Exit code follows the worst severity found: 0 (none), 1 (warning), 2
//! (breaking) — mirrored by [`Severity::exit_code`].

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::loader::load_flow_from_file;
use crate::model::{FlowDefinition, StepSpec};

#[derive(clap::Args, Debug)]
pub struct DiffArgs {
    pub base: PathBuf,
    pub target: PathBuf,

    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Breaking,
}

impl Severity {
    pub fn exit_code(self) -> i32 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Breaking => 2,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DiffEntry {
    pub step_id: String,
    pub severity: Severity,
    pub message: String,
}

pub fn run(args: DiffArgs) -> anyhow::Result<()> {
    let base = load_flow_from_file(&args.base, true)?;
    let target = load_flow_from_file(&args.target, true)?;
    let entries = diff_flows(&base, &target);

    let worst = entries.iter().map(|e| e.severity).max();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("no differences");
    } else {
        for entry in &entries {
            println!("[{:?}] {}: {}", entry.severity, entry.step_id, entry.message);
        }
    }

    std::process::exit(worst.map(Severity::exit_code).unwrap_or(0));
}

fn diff_flows(base: &FlowDefinition, target: &FlowDefinition) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    let base_steps: HashMap<&str, &StepSpec> = base.steps.iter().map(|s| (s.id(), s)).collect();
    let target_steps: HashMap<&str, &StepSpec> = target.steps.iter().map(|s| (s.id(), s)).collect();

    for (id, base_step) in &base_steps {
        match target_steps.get(id) {
            None => entries.push(DiffEntry {
                step_id: id.to_string(),
                severity: Severity::Breaking,
                message: "step removed".to_string(),
            }),
            Some(target_step) => entries.extend(diff_step(id, base_step, target_step)),
        }
    }

    for id in target_steps.keys() {
        if !base_steps.contains_key(id) {
            entries.push(DiffEntry {
                step_id: id.to_string(),
                severity: Severity::Info,
                message: "step added".to_string(),
            });
        }
    }

    entries
}

fn diff_step(id: &str, base: &StepSpec, target: &StepSpec) -> Vec<DiffEntry> {
    let mut entries = Vec::new();

    if base.uses() != target.uses() {
        entries.push(DiffEntry {
            step_id: id.to_string(),
            severity: Severity::Breaking,
            message: format!("uses changed from '{}' to '{}'", base.uses(), target.uses()),
        });
    }

    let (base_common, target_common) = (base.common(), target.common());

    if target_common.timeout_sec < base_common.timeout_sec {
        entries.push(DiffEntry {
            step_id: id.to_string(),
            severity: Severity::Breaking,
            message: format!(
                "timeout_sec decreased from {} to {}",
                base_common.timeout_sec, target_common.timeout_sec
            ),
        });
    } else if target_common.timeout_sec > base_common.timeout_sec {
        entries.push(DiffEntry {
            step_id: id.to_string(),
            severity: Severity::Info,
            message: format!(
                "timeout_sec increased from {} to {}",
                base_common.timeout_sec, target_common.timeout_sec
            ),
        });
    }

    if target_common.retries < base_common.retries {
        entries.push(DiffEntry {
            step_id: id.to_string(),
            severity: Severity::Breaking,
            message: format!("retries decreased from {} to {}", base_common.retries, target_common.retries),
        });
    } else if target_common.retries > base_common.retries {
        entries.push(DiffEntry {
            step_id: id.to_string(),
            severity: Severity::Info,
            message: format!("retries increased from {} to {}", base_common.retries, target_common.retries),
        });
    }

    if base_common.depends_on != target_common.depends_on {
        entries.push(DiffEntry {
            step_id: id.to_string(),
            severity: Severity::Warning,
            message: "depends_on changed".to_string(),
        });
    }

    if base_common.continue_on_error != target_common.continue_on_error {
        entries.push(DiffEntry {
            step_id: id.to_string(),
            severity: Severity::Warning,
            message: format!(
                "continue_on_error changed from {} to {}",
                base_common.continue_on_error, target_common.continue_on_error
            ),
        });
    }

    for key in removed_input_keys(base, target) {
        entries.push(DiffEntry {
            step_id: id.to_string(),
            severity: Severity::Breaking,
            message: format!("required input '{key}' removed"),
        });
    }

    entries
}

fn removed_input_keys(base: &StepSpec, target: &StepSpec) -> Vec<String> {
    let (base_keys, target_keys) = match (base, target) {
        (StepSpec::Agent(b), StepSpec::Agent(t)) => (input_keys(&b.input), input_keys(&t.input)),
        (StepSpec::Mcp(b), StepSpec::Mcp(t)) => {
            let mut base_keys: Vec<String> = b.input.variables.keys().cloned().collect();
            if b.input.prompt.is_some() || b.input.prompt_from.is_some() {
                base_keys.push("prompt".to_string());
            }
            let mut target_keys: Vec<String> = t.input.variables.keys().cloned().collect();
            if t.input.prompt.is_some() || t.input.prompt_from.is_some() {
                target_keys.push("prompt".to_string());
            }
            (base_keys, target_keys)
        }
        _ => return Vec::new(),
    };
    base_keys.into_iter().filter(|k| !target_keys.contains(k)).collect()
}

fn input_keys(map: &serde_json::Map<String, Value>) -> Vec<String> {
    map.keys().cloned().collect()
}
