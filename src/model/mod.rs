//! The flow document data model: what a flow file deserializes into, plus
//! the event/summary records the runner emits while executing one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_timeout_sec() -> u64 {
    60
}

fn default_output_dir() -> String {
    "./.runs/${RUN_ID}".to_string()
}

/// `run:` block of a flow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

/// Fields common to every step kind, flattened into each variant by serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCommon {
    pub id: String,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellStepSpec {
    #[serde(flatten)]
    pub common: StepCommon,
    pub run: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpInputSpec {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub prompt_from: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpPolicySpec {
    pub model: String,
    pub prompt_limit: u64,
    #[serde(default)]
    pub prompt_buffer: u64,
    #[serde(default = "default_sandbox")]
    pub sandbox: String,
}

fn default_sandbox() -> String {
    "read-only".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpSaveSpec {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpStepSpec {
    #[serde(flatten)]
    pub common: StepCommon,
    pub input: McpInputSpec,
    pub policy: McpPolicySpec,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    #[serde(default)]
    pub save: Option<McpSaveSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStepSpec {
    #[serde(flatten)]
    pub common: StepCommon,
    /// `module:ClassName`-shaped key into the compiled agent registry.
    pub uses: String,
    #[serde(default)]
    pub input: serde_json::Map<String, Value>,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

/// A single step declaration. Deserialized as an untagged union: each
/// variant is tried in order and the first one whose required fields are
/// present wins, so `Shell` (requires `run`) and `Mcp` (requires `policy`)
/// must be tried before the catch-all `Agent` variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    Shell(ShellStepSpec),
    Mcp(McpStepSpec),
    Agent(AgentStepSpec),
}

impl StepSpec {
    pub fn common(&self) -> &StepCommon {
        match self {
            StepSpec::Shell(s) => &s.common,
            StepSpec::Mcp(s) => &s.common,
            StepSpec::Agent(s) => &s.common,
        }
    }

    pub fn id(&self) -> &str {
        &self.common().id
    }

    pub fn depends_on(&self) -> &[String] {
        &self.common().depends_on
    }

    pub fn uses(&self) -> &str {
        match self {
            StepSpec::Shell(_) => "shell",
            StepSpec::Mcp(_) => "mcp",
            StepSpec::Agent(s) => &s.uses,
        }
    }
}

/// The full flow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub version: u32,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub agent_paths: Vec<String>,
    pub steps: Vec<StepSpec>,
}

/// One line of `runs.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub ts: String,
    pub run_id: String,
    pub step: String,
    pub event: String, // "start" | "end" | "error"
    pub status: String, // "ok" | "fail"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub retries: u32,
    pub attempt: u32,
    #[serde(default)]
    pub extra: serde_json::Map<String, Value>,
}

/// One line of `mcp_calls.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpAuditRecord {
    pub ts: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<usize>,
    pub latency_ms: f64,
    pub prompt_chars: usize,
    pub token_usage: Value,
    pub status: String, // "ok" | "error" | "prompt_limit_exceeded"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepSummary {
    pub ok: u64,
    pub fail: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    pub error: String,
    pub fatal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub steps: HashMap<String, StepSummary>,
    pub started_at: String,
    pub finished_at: String,
    #[serde(default)]
    pub failures: HashMap<String, StepFailure>,
}

/// Nearest-rank percentile, used for the per-run `StepSummary.p50_ms`/`p95_ms`
/// fields. Distinct from the linear-interpolation percentile the CLI's
/// `stats` command uses when aggregating across multiple runs (see
/// `crate::cli::stats::interpolated_percentile`) — the two are deliberately
/// different algorithms, not a bug.
pub fn compute_percentile(samples: &[f64], percentile: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut ordered = samples.to_vec();
    ordered.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = ((percentile / 100.0) * ordered.len() as f64).round().max(1.0) as usize;
    let index = rank.saturating_sub(1).min(ordered.len() - 1);
    ordered[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_nearest_rank_matches_reference() {
        let samples = vec![10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(compute_percentile(&samples, 50.0), 30.0);
        assert_eq!(compute_percentile(&samples, 95.0), 50.0);
    }

    #[test]
    fn percentile_of_single_sample() {
        assert_eq!(compute_percentile(&[42.0], 95.0), 42.0);
    }

    #[test]
    fn percentile_of_empty_is_zero() {
        assert_eq!(compute_percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn deserializes_shell_step() {
        let json = serde_json::json!({
            "id": "build",
            "uses": "shell",
            "run": "echo hi",
        });
        let step: StepSpec = serde_json::from_value(json).unwrap();
        match step {
            StepSpec::Shell(s) => {
                assert_eq!(s.run, "echo hi");
                assert_eq!(s.common.id, "build");
            }
            _ => panic!("expected shell step"),
        }
    }

    #[test]
    fn deserializes_agent_step() {
        let json = serde_json::json!({
            "id": "summarize",
            "uses": "agents.quality:EchoAgent",
            "input": {"text": "hello"},
        });
        let step: StepSpec = serde_json::from_value(json).unwrap();
        match step {
            StepSpec::Agent(s) => assert_eq!(s.uses, "agents.quality:EchoAgent"),
            _ => panic!("expected agent step"),
        }
    }
}
