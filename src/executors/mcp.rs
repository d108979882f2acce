//! MCP step: resolves a prompt template, calls the MCP Router, and
//! optionally persists the returned text as an artifact.

use async_trait::async_trait;
use serde_json::json;

use crate::context::{looks_like_path, resolve_path_like, ExecutionContext};
use crate::errors::FlowError;
use crate::model::{McpStepSpec, StepSpec};
use crate::router::GenerateRequest;

use super::{StepExecutor, StepOutcome};

pub struct McpExecutor;

#[async_trait]
impl StepExecutor for McpExecutor {
    async fn run(&self, spec: &StepSpec, context: &ExecutionContext) -> Result<StepOutcome, FlowError> {
        let step = match spec {
            StepSpec::Mcp(s) => s,
            _ => unreachable!("executor_for dispatched a non-mcp step to McpExecutor"),
        };

        let router = context.mcp_router.as_ref().ok_or_else(|| FlowError::StepFailure {
            step_id: step.common.id.clone(),
            reason: "no mcp router available in execution context".to_string(),
        })?;

        let template = resolve_prompt_template(step, context)?;
        let variables = build_variables(step, context);
        let prompt = render_template(&template, &variables).map_err(|missing| FlowError::StepFailure {
            step_id: step.common.id.clone(),
            reason: format!("missing template variable '{missing}'"),
        })?;

        let mut config = step.config.clone();
        let router_retries = config
            .remove("router_retries")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);

        let response = router
            .generate(GenerateRequest {
                prompt,
                model: step.policy.model.clone(),
                prompt_limit: step.policy.prompt_limit,
                prompt_buffer: step.policy.prompt_buffer,
                sandbox: step.policy.sandbox.clone(),
                approval_policy: "never".to_string(),
                config,
                timeout_sec: step.common.timeout_sec,
                retries: router_retries,
            })
            .await
            .map_err(|e| match e {
                FlowError::PromptLimitExceeded { .. } => e,
                other => FlowError::StepFailure {
                    step_id: step.common.id.clone(),
                    reason: other.to_string(),
                },
            })?;

        let mut save_outcome = serde_json::Map::new();
        if let Some(save) = &step.save {
            if let Some(relative) = &save.text {
                let target = if std::path::Path::new(relative).is_absolute() {
                    std::path::PathBuf::from(relative)
                } else {
                    context.run_dir.join(relative)
                };
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| FlowError::StepFailure {
                        step_id: step.common.id.clone(),
                        reason: format!("failed to create artifact directory: {e}"),
                    })?;
                }
                std::fs::write(&target, &response.text).map_err(|e| FlowError::StepFailure {
                    step_id: step.common.id.clone(),
                    reason: format!("failed to write saved text: {e}"),
                })?;
                save_outcome.insert("saved_text".to_string(), json!(target.to_string_lossy()));
            }
        }

        let mut outcome = StepOutcome::new();
        outcome.insert("provider".to_string(), response.meta.get("provider").cloned().unwrap_or(json!(null)));
        outcome.insert(
            "token_usage".to_string(),
            response.meta.get("token_usage").cloned().unwrap_or(json!(null)),
        );
        outcome.insert(
            "latency_ms".to_string(),
            response.meta.get("latency_ms").cloned().unwrap_or(json!(null)),
        );
        outcome.insert("save".to_string(), serde_json::Value::Object(save_outcome));
        Ok(outcome)
    }
}

fn resolve_prompt_template(step: &McpStepSpec, context: &ExecutionContext) -> Result<String, FlowError> {
    if let Some(prompt) = &step.input.prompt {
        return Ok(prompt.clone());
    }
    let path_str = step.input.prompt_from.as_ref().ok_or_else(|| FlowError::StepFailure {
        step_id: step.common.id.clone(),
        reason: "mcp step declares neither 'prompt' nor 'prompt_from'".to_string(),
    })?;
    let candidate = std::path::Path::new(path_str);
    let resolved = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        let in_flow_dir = context.flow_dir.join(candidate);
        if in_flow_dir.exists() {
            in_flow_dir
        } else {
            context.workspace_dir.join(candidate)
        }
    };
    std::fs::read_to_string(&resolved).map_err(|e| FlowError::StepFailure {
        step_id: step.common.id.clone(),
        reason: format!("prompt_from '{path_str}' could not be read: {e}"),
    })
}

fn build_variables(step: &McpStepSpec, context: &ExecutionContext) -> std::collections::HashMap<String, String> {
    let mut variables = std::collections::HashMap::new();
    variables.insert("run_id".to_string(), context.run_id.clone());
    variables.insert("run_dir".to_string(), context.run_dir.to_string_lossy().to_string());
    variables.insert("artifacts_dir".to_string(), context.artifacts_dir.to_string_lossy().to_string());
    for (key, value) in &step.input.variables {
        let resolved = if looks_like_path(value) {
            resolve_path_like(value, &context.run_dir, &context.flow_dir, &context.workspace_dir)
                .to_string_lossy()
                .to_string()
        } else {
            value.clone()
        };
        variables.insert(key.clone(), resolved);
    }
    variables
}

/// `{key}`-style interpolation; returns the name of the first variable
/// referenced in the template but missing from `variables`.
fn render_template(template: &str, variables: &std::collections::HashMap<String, String>) -> Result<String, String> {
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut key = String::new();
            let mut closed = false;
            for next in chars.by_ref() {
                if next == '}' {
                    closed = true;
                    break;
                }
                key.push(next);
            }
            if !closed {
                output.push('{');
                output.push_str(&key);
                continue;
            }
            match variables.get(&key) {
                Some(value) => output.push_str(value),
                None => return Err(key),
            }
        } else {
            output.push(c);
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_template_substitutes_known_keys() {
        let mut vars = std::collections::HashMap::new();
        vars.insert("run_id".to_string(), "abc123".to_string());
        let rendered = render_template("run is {run_id}", &vars).unwrap();
        assert_eq!(rendered, "run is abc123");
    }

    #[test]
    fn render_template_reports_missing_key() {
        let vars = std::collections::HashMap::new();
        let err = render_template("need {missing}", &vars).unwrap_err();
        assert_eq!(err, "missing");
    }
}
