//! The Flow Runner: resolves a run directory, builds the DAG plan, and
//! drives it to completion with dependency-bound concurrency, per-step
//! retry/backoff, and a `runs.jsonl` event trail.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::config::RunnerConfig;
use crate::context::ExecutionContext;
use crate::errors::FlowError;
use crate::executors::{self, StepOutcome};
use crate::jsonl::AsyncLineWriter;
use crate::limits::ExecutionLimits;
use crate::model::{compute_percentile, FlowDefinition, RunEvent, RunSummary, StepFailure, StepSpec, StepSummary};
use crate::planner;
use crate::redactor::mask_sensitive;
use crate::retry::step_backoff;
use crate::router::Router;

#[derive(Debug, Default)]
struct StepAccumulator {
    ok: u64,
    fail: u64,
    latencies: Vec<f64>,
}

struct StepRunOutcome {
    step_id: String,
    success: bool,
    latency_ms: Option<f64>,
    error: Option<String>,
    extra: StepOutcome,
    fatal: bool,
}

/// Everything needed to execute one flow run and produce its artifacts.
pub struct FlowRunner {
    flow: FlowDefinition,
    flow_dir: PathBuf,
    workspace_dir: PathBuf,
    run_id: String,
    run_dir: PathBuf,
    artifacts_dir: PathBuf,
    steps: Vec<StepSpec>,
    precompleted: HashSet<String>,
    log_flush_every: usize,
    limits: ExecutionLimits,
}

impl FlowRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flow: FlowDefinition,
        flow_path: impl AsRef<Path>,
        run_id: Option<String>,
        output_dir: Option<PathBuf>,
        workspace_dir: Option<PathBuf>,
        only: Option<&[String]>,
        continue_from: Option<&str>,
        dev_fast: bool,
    ) -> Result<Self, FlowError> {
        let flow_path = flow_path.as_ref().to_path_buf();
        let flow_dir = flow_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let workspace_dir = workspace_dir.unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
        let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let plan = planner::plan(&flow, only, continue_from)?;
        let steps: Vec<StepSpec> = flow
            .steps
            .iter()
            .filter(|s| plan.order.contains(&s.id().to_string()))
            .cloned()
            .collect();

        let runner_config = RunnerConfig::from_env();
        let run_dir = resolve_run_dir(&flow, &run_id, output_dir, &workspace_dir, &runner_config);
        let artifacts_dir = run_dir.join("artifacts");
        let log_flush_every = if dev_fast { 1 } else { runner_config.log_flush_every };

        Ok(Self {
            flow,
            flow_dir,
            workspace_dir,
            run_id,
            run_dir,
            artifacts_dir,
            steps,
            precompleted: plan.precompleted,
            log_flush_every,
            limits: ExecutionLimits::from_env(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Topological order of the steps this runner will execute, without
    /// running anything. Used for `flowctl run --dry-run`.
    pub fn dry_run_order(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id().to_string()).collect()
    }

    /// Executes the flow, writes `summary.json`, and returns the run id.
    /// An `Err(FlowError::FatalExecution(..))` means at least one
    /// non-`continue_on_error` step failed; artifacts and the summary are
    /// still written before the error is returned.
    pub async fn run(&self) -> Result<String, FlowError> {
        let limit_check = crate::limits::validate_limits(self.steps.len(), self.total_possible_retries(), &self.limits);
        if !limit_check.passed {
            let reasons: Vec<String> = limit_check.violations.iter().map(|v| v.message.clone()).collect();
            return Err(FlowError::FatalExecution(format!(
                "flow rejected by execution limits: {}",
                reasons.join("; ")
            )));
        }

        std::fs::create_dir_all(&self.run_dir).map_err(|e| FlowError::FatalExecution(e.to_string()))?;
        std::fs::create_dir_all(&self.artifacts_dir).map_err(|e| FlowError::FatalExecution(e.to_string()))?;
        let started_at = Utc::now();

        let runs_log_path = self.run_dir.join("runs.jsonl");
        let writer = Arc::new(
            AsyncLineWriter::open(&runs_log_path, self.log_flush_every)
                .map_err(|e| FlowError::FatalExecution(e.to_string()))?,
        );

        let router = Router::from_env(&self.run_dir).map_err(|e| FlowError::FatalExecution(e.to_string()))?;
        let mut context = ExecutionContext::new(
            self.run_id.clone(),
            self.run_dir.clone(),
            self.workspace_dir.clone(),
            self.flow_dir.clone(),
        );
        context.mcp_router = Some(router);
        context.agent_paths = self.flow.agent_paths.clone();
        let context = Arc::new(context);

        let stats: Arc<StdMutex<HashMap<String, StepAccumulator>>> = Arc::new(StdMutex::new(
            self.steps.iter().map(|s| (s.id().to_string(), StepAccumulator::default())).collect(),
        ));

        let execution_result = self.execute_dag(context, writer.clone(), stats.clone()).await;

        let finished_at = Utc::now();
        let summary = self.build_summary(started_at, finished_at, &stats, &execution_result);
        let summary_path = self.run_dir.join("summary.json");
        let summary_json = serde_json::to_string_pretty(&summary).unwrap_or_default();
        std::fs::write(&summary_path, summary_json).map_err(|e| FlowError::FatalExecution(e.to_string()))?;

        if !execution_result.fatal_failures.is_empty() {
            let message = format_failure_message(&execution_result);
            return Err(FlowError::FatalExecution(message));
        }

        Ok(self.run_id.clone())
    }

    fn total_possible_retries(&self) -> u32 {
        self.steps.iter().map(|s| s.common().retries).sum()
    }

    async fn execute_dag(
        &self,
        context: Arc<ExecutionContext>,
        writer: Arc<AsyncLineWriter>,
        stats: Arc<StdMutex<HashMap<String, StepAccumulator>>>,
    ) -> ExecutionResult {
        let steps_by_id: HashMap<String, Arc<StepSpec>> =
            self.steps.iter().map(|s| (s.id().to_string(), Arc::new(s.clone()))).collect();

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for step in &self.steps {
            for dep in step.depends_on() {
                dependents.entry(dep.clone()).or_default().push(step.id().to_string());
            }
        }

        let mut remaining_deps: HashMap<String, usize> = HashMap::new();
        for step in &self.steps {
            let remaining = step
                .depends_on()
                .iter()
                .filter(|d| !self.precompleted.contains(d.as_str()))
                .count();
            remaining_deps.insert(step.id().to_string(), remaining);
        }

        let mut ready: VecDeque<String> = remaining_deps
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut pending: HashSet<String> = remaining_deps
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut completed: HashSet<String> = self.precompleted.clone();
        let mut failed_outcomes: Vec<StepRunOutcome> = Vec::new();
        let mut failed_fatal = false;

        let mut running: JoinSet<StepRunOutcome> = JoinSet::new();

        loop {
            if !failed_fatal {
                while let Some(step_id) = ready.pop_front() {
                    let step = steps_by_id.get(&step_id).expect("ready step must be known").clone();
                    let context = context.clone();
                    let writer = writer.clone();
                    let stats = stats.clone();
                    running.spawn(run_step_with_retry(step, context, writer, stats));
                }
            }

            if running.is_empty() {
                break;
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => StepRunOutcome {
                    step_id: "unknown".to_string(),
                    success: false,
                    latency_ms: None,
                    error: Some(format!("step task panicked: {e}")),
                    extra: StepOutcome::new(),
                    fatal: true,
                },
            };

            if outcome.success {
                completed.insert(outcome.step_id.clone());
                mark_ready(&outcome.step_id, &dependents, &mut remaining_deps, &mut pending, &mut ready);
            } else {
                let step_id = outcome.step_id.clone();
                let fatal = outcome.fatal;
                if let Ok(mut guard) = stats.lock() {
                    guard.entry(step_id.clone()).or_default().fail += 1;
                }
                failed_outcomes.push(outcome);
                if fatal {
                    failed_fatal = true;
                } else {
                    completed.insert(step_id.clone());
                    mark_ready(&step_id, &dependents, &mut remaining_deps, &mut pending, &mut ready);
                }
            }

            if failed_fatal {
                running.abort_all();
                while running.join_next().await.is_some() {}
                break;
            }
        }

        ExecutionResult { failed: failed_outcomes }
    }

    fn build_summary(
        &self,
        started_at: chrono::DateTime<Utc>,
        finished_at: chrono::DateTime<Utc>,
        stats: &Arc<StdMutex<HashMap<String, StepAccumulator>>>,
        execution_result: &ExecutionResult,
    ) -> RunSummary {
        let guard = stats.lock().unwrap_or_else(|e| e.into_inner());
        let mut steps = HashMap::new();
        for (step_id, acc) in guard.iter() {
            steps.insert(
                step_id.clone(),
                StepSummary {
                    ok: acc.ok,
                    fail: acc.fail,
                    p50_ms: compute_percentile(&acc.latencies, 50.0),
                    p95_ms: compute_percentile(&acc.latencies, 95.0),
                },
            );
        }
        let mut failures = HashMap::new();
        for outcome in &execution_result.failed {
            failures.insert(
                outcome.step_id.clone(),
                StepFailure {
                    error: outcome.error.clone().unwrap_or_default(),
                    fatal: outcome.fatal,
                },
            );
        }
        RunSummary {
            run_id: self.run_id.clone(),
            steps,
            started_at: started_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            finished_at: finished_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            failures,
        }
    }
}

struct ExecutionResult {
    failed: Vec<StepRunOutcome>,
}

impl ExecutionResult {
    fn fatal_failures(&self) -> Vec<&StepRunOutcome> {
        self.failed.iter().filter(|o| o.fatal).collect()
    }
}

fn mark_ready(
    step_id: &str,
    dependents: &HashMap<String, Vec<String>>,
    remaining_deps: &mut HashMap<String, usize>,
    pending: &mut HashSet<String>,
    ready: &mut VecDeque<String>,
) {
    let Some(children) = dependents.get(step_id) else {
        return;
    };
    for child in children {
        if let Some(count) = remaining_deps.get_mut(child) {
            if *count > 0 {
                *count -= 1;
            }
            if *count == 0 && pending.remove(child) {
                ready.push_back(child.clone());
            }
        }
    }
}

async fn run_step_with_retry(
    step: Arc<StepSpec>,
    context: Arc<ExecutionContext>,
    writer: Arc<AsyncLineWriter>,
    stats: Arc<StdMutex<HashMap<String, StepAccumulator>>>,
) -> StepRunOutcome {
    let retries = step.common().retries;
    let attempts_total = retries + 1;
    let mut last_error: Option<String> = None;
    let mut last_was_timeout = false;

    for attempt in 1..=attempts_total {
        log_event(
            &writer,
            &context.run_id,
            step.id(),
            "start",
            "ok",
            None,
            retries,
            attempt,
            json!({"type": step.uses()}),
        );

        let started = std::time::Instant::now();
        let executor = executors::executor_for(&step);
        let timeout = std::time::Duration::from_secs(step.common().timeout_sec.max(1));
        let outcome = tokio::time::timeout(timeout, executor.run(&step, &context)).await;

        match outcome {
            Ok(Ok(extra)) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                if let Ok(mut guard) = stats.lock() {
                    let entry = guard.entry(step.id().to_string()).or_default();
                    entry.ok += 1;
                    entry.latencies.push(latency_ms);
                }
                log_event(
                    &writer,
                    &context.run_id,
                    step.id(),
                    "end",
                    "ok",
                    Some(latency_ms),
                    retries,
                    attempt,
                    json!({"result": Value::Object(extra.clone()), "type": step.uses()}),
                );
                return StepRunOutcome {
                    step_id: step.id().to_string(),
                    success: true,
                    latency_ms: Some(latency_ms),
                    error: None,
                    extra,
                    fatal: false,
                };
            }
            Ok(Err(err)) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                last_was_timeout = false;
                last_error = Some(err.to_string());
                log_event(
                    &writer,
                    &context.run_id,
                    step.id(),
                    "error",
                    "fail",
                    Some(latency_ms),
                    retries,
                    attempt,
                    json!({"error": err.to_string(), "type": step.uses()}),
                );
                if !err.is_retriable() {
                    break;
                }
            }
            Err(_) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                last_was_timeout = true;
                last_error = Some(format!("timed out after {}s", step.common().timeout_sec));
                log_event(
                    &writer,
                    &context.run_id,
                    step.id(),
                    "error",
                    "fail",
                    Some(latency_ms),
                    retries,
                    attempt,
                    json!({"error": "timeout", "type": step.uses()}),
                );
            }
        }

        if attempt < attempts_total {
            tokio::time::sleep(step_backoff(std::time::Duration::from_secs_f64(0.5), attempt)).await;
        } else {
            break;
        }
    }

    let _ = last_was_timeout;
    StepRunOutcome {
        step_id: step.id().to_string(),
        success: false,
        latency_ms: None,
        error: last_error,
        extra: StepOutcome::new(),
        fatal: !step.common().continue_on_error,
    }
}

#[allow(clippy::too_many_arguments)]
fn log_event(
    writer: &AsyncLineWriter,
    run_id: &str,
    step_id: &str,
    event: &str,
    status: &str,
    latency_ms: Option<f64>,
    retries: u32,
    attempt: u32,
    extra: Value,
) {
    let extra_map = extra.as_object().cloned().unwrap_or_default();
    let run_event = RunEvent {
        ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        run_id: run_id.to_string(),
        step: step_id.to_string(),
        event: event.to_string(),
        status: status.to_string(),
        latency_ms,
        retries,
        attempt,
        extra: extra_map,
    };
    let value = serde_json::to_value(&run_event).unwrap_or(Value::Null);
    let masked = mask_sensitive(&value);
    if let Ok(line) = serde_json::to_string(&masked) {
        writer.write_line(line);
    }
}

fn format_failure_message(result: &ExecutionResult) -> String {
    let mut lines = vec!["fatal step failure(s) detected:".to_string()];
    for outcome in result.fatal_failures() {
        let error_text = outcome.error.clone().unwrap_or_else(|| "unknown error".to_string());
        lines.push(format!("- {}: {}", outcome.step_id, error_text));
    }
    let non_fatal: Vec<&StepRunOutcome> = result.failed.iter().filter(|o| !o.fatal).collect();
    if !non_fatal.is_empty() {
        lines.push("non-fatal step failures:".to_string());
        for outcome in non_fatal {
            let error_text = outcome.error.clone().unwrap_or_else(|| "unknown error".to_string());
            lines.push(format!("- {}: {}", outcome.step_id, error_text));
        }
    }
    lines.join("\n")
}

fn resolve_run_dir(
    flow: &FlowDefinition,
    run_id: &str,
    output_override: Option<PathBuf>,
    workspace_dir: &Path,
    config: &RunnerConfig,
) -> PathBuf {
    let base = if let Some(dir) = output_override {
        expand_home(&dir)
    } else {
        let mut template = flow.run.output_dir.clone();
        if let Some(base_dir) = &config.base_output_dir {
            if let Some(rest) = template.strip_prefix("./") {
                template = Path::new(base_dir).join(rest).to_string_lossy().to_string();
            }
        }
        let template = template.replace("${RUN_ID}", run_id);
        expand_home(Path::new(&template))
    };
    if base.is_absolute() {
        base
    } else {
        workspace_dir.join(base)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunConfig, ShellStepSpec, StepCommon};

    fn shell(id: &str, run: &str, depends_on: Vec<&str>, retries: u32, continue_on_error: bool) -> StepSpec {
        StepSpec::Shell(ShellStepSpec {
            common: StepCommon {
                id: id.to_string(),
                continue_on_error,
                timeout_sec: 5,
                retries,
                depends_on: depends_on.into_iter().map(str::to_string).collect(),
            },
            run: run.to_string(),
        })
    }

    fn flow(steps: Vec<StepSpec>) -> FlowDefinition {
        FlowDefinition {
            version: 1,
            run: RunConfig {
                output_dir: "./.runs/${RUN_ID}".to_string(),
            },
            agent_paths: vec![],
            steps,
        }
    }

    #[tokio::test]
    async fn runs_a_linear_flow_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let flow_path = dir.path().join("flow.yaml");
        std::fs::write(&flow_path, "version: 1\nsteps: []\n").unwrap();

        let f = flow(vec![
            shell("a", "true", vec![], 0, false),
            shell("b", "true", vec!["a"], 0, false),
        ]);

        let runner = FlowRunner::new(
            f,
            &flow_path,
            Some("test-run".to_string()),
            Some(dir.path().join("out")),
            Some(dir.path().to_path_buf()),
            None,
            None,
            true,
        )
        .unwrap();

        let run_id = runner.run().await.unwrap();
        assert_eq!(run_id, "test-run");
        assert!(runner.run_dir().join("summary.json").exists());
        assert!(runner.run_dir().join("runs.jsonl").exists());
    }

    #[tokio::test]
    async fn fatal_step_failure_is_reported_but_summary_still_written() {
        let dir = tempfile::tempdir().unwrap();
        let flow_path = dir.path().join("flow.yaml");
        std::fs::write(&flow_path, "version: 1\nsteps: []\n").unwrap();

        let f = flow(vec![shell("a", "false", vec![], 0, false)]);

        let runner = FlowRunner::new(
            f,
            &flow_path,
            Some("test-run-2".to_string()),
            Some(dir.path().join("out")),
            Some(dir.path().to_path_buf()),
            None,
            None,
            true,
        )
        .unwrap();

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, FlowError::FatalExecution(_)));
        assert!(runner.run_dir().join("summary.json").exists());
    }

    #[tokio::test]
    async fn continue_on_error_step_does_not_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let flow_path = dir.path().join("flow.yaml");
        std::fs::write(&flow_path, "version: 1\nsteps: []\n").unwrap();

        let f = flow(vec![
            shell("a", "false", vec![], 0, true),
            shell("b", "true", vec!["a"], 0, false),
        ]);

        let runner = FlowRunner::new(
            f,
            &flow_path,
            Some("test-run-3".to_string()),
            Some(dir.path().join("out")),
            Some(dir.path().to_path_buf()),
            None,
            None,
            true,
        )
        .unwrap();

        let run_id = runner.run().await.unwrap();
        assert_eq!(run_id, "test-run-3");
    }
}
