//! Dynamic agent step: looks the `uses` key up in the compiled agent
//! registry and runs it.

use async_trait::async_trait;

use crate::agents;
use crate::context::ExecutionContext;
use crate::errors::FlowError;
use crate::model::StepSpec;

use super::{StepExecutor, StepOutcome};

pub struct AgentExecutor;

#[async_trait]
impl StepExecutor for AgentExecutor {
    async fn run(&self, spec: &StepSpec, context: &ExecutionContext) -> Result<StepOutcome, FlowError> {
        let step = match spec {
            StepSpec::Agent(s) => s,
            _ => unreachable!("executor_for dispatched a non-agent step to AgentExecutor"),
        };

        let agent = agents::resolve(&step.uses, &context.agent_paths, &step.config)?;
        agent.run(&step.input, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentStepSpec, StepCommon};
    use std::path::PathBuf;

    #[tokio::test]
    async fn runs_registered_echo_agent() {
        let mut input = serde_json::Map::new();
        input.insert("text".to_string(), serde_json::json!("hello"));

        let spec = StepSpec::Agent(AgentStepSpec {
            common: StepCommon {
                id: "echo".into(),
                continue_on_error: false,
                timeout_sec: 5,
                retries: 0,
                depends_on: vec![],
            },
            uses: "agents.builtin:EchoAgent".to_string(),
            input,
            config: serde_json::Map::new(),
        });

        let mut context = ExecutionContext::new(
            "run".to_string(),
            PathBuf::from("."),
            PathBuf::from("."),
            PathBuf::from("."),
        );
        context.agent_paths = vec!["agents.builtin".to_string()];

        let outcome = AgentExecutor.run(&spec, &context).await.unwrap();
        assert_eq!(outcome["result"]["text"], serde_json::json!("hello"));
    }

    #[tokio::test]
    async fn rejects_namespace_not_declared_by_flow() {
        let spec = StepSpec::Agent(AgentStepSpec {
            common: StepCommon {
                id: "echo".into(),
                continue_on_error: false,
                timeout_sec: 5,
                retries: 0,
                depends_on: vec![],
            },
            uses: "agents.builtin:EchoAgent".to_string(),
            input: serde_json::Map::new(),
            config: serde_json::Map::new(),
        });
        let context = ExecutionContext::new(
            "run".to_string(),
            PathBuf::from("."),
            PathBuf::from("."),
            PathBuf::from("."),
        );
        assert!(AgentExecutor.run(&spec, &context).await.is_err());
    }
}
