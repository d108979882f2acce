//! Shell step: runs `run` through the host shell with the workspace as the
//! working directory.

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use crate::context::ExecutionContext;
use crate::errors::FlowError;
use crate::model::StepSpec;

use super::{StepExecutor, StepOutcome};

const MAX_DETAIL_CHARS: usize = 500;

pub struct ShellExecutor;

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn run(&self, spec: &StepSpec, context: &ExecutionContext) -> Result<StepOutcome, FlowError> {
        let step = match spec {
            StepSpec::Shell(s) => s,
            _ => unreachable!("executor_for dispatched a non-shell step to ShellExecutor"),
        };

        let mut command = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&step.run);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&step.run);
            c
        };
        command
            .current_dir(&context.workspace_dir)
            .env("FLOW_RUN_ID", &context.run_id)
            .env("FLOW_OUTPUT_DIR", context.run_dir.to_string_lossy().to_string())
            .env("FLOW_ARTIFACTS_DIR", context.artifacts_dir.to_string_lossy().to_string())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let output = command.output().await.map_err(|e| FlowError::StepFailure {
            step_id: step.common.id.clone(),
            reason: format!("failed to spawn shell command: {e}"),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let detail_source = if stderr.is_empty() { &stdout } else { &stderr };
            let detail = truncate(detail_source);
            return Err(FlowError::StepFailure {
                step_id: step.common.id.clone(),
                reason: detail,
            });
        }

        let mut outcome = StepOutcome::new();
        outcome.insert("stdout".to_string(), json!(stdout));
        outcome.insert("stderr".to_string(), json!(stderr));
        outcome.insert("command".to_string(), json!(step.run));
        Ok(outcome)
    }
}

fn truncate(detail: &str) -> String {
    if detail.chars().count() > MAX_DETAIL_CHARS {
        let head: String = detail.chars().take(MAX_DETAIL_CHARS - 3).collect();
        format!("{head}...")
    } else {
        detail.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepCommon;
    use std::path::PathBuf;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "run-1".to_string(),
            PathBuf::from("/tmp/flowctl-test-run"),
            PathBuf::from("."),
            PathBuf::from("."),
        )
    }

    fn shell_step(run: &str) -> StepSpec {
        StepSpec::Shell(crate::model::ShellStepSpec {
            common: StepCommon {
                id: "s1".into(),
                continue_on_error: false,
                timeout_sec: 5,
                retries: 0,
                depends_on: vec![],
            },
            run: run.to_string(),
        })
    }

    #[tokio::test]
    async fn successful_command_returns_trimmed_streams() {
        let spec = shell_step("echo hello");
        let outcome = ShellExecutor.run(&spec, &ctx()).await.unwrap();
        assert_eq!(outcome["stdout"], json!("hello"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_step_failure() {
        let spec = shell_step("exit 1");
        let result = ShellExecutor.run(&spec, &ctx()).await;
        assert!(matches!(result, Err(FlowError::StepFailure { .. })));
    }

    #[test]
    fn truncate_caps_at_500_chars() {
        let long = "x".repeat(600);
        let result = truncate(&long);
        assert_eq!(result.chars().count(), MAX_DETAIL_CHARS);
        assert!(result.ends_with("..."));
    }
}
