//! Compiled-in registry of dynamic agents, replacing the runtime
//! `module:ClassName` import the distilled system uses. A flow's
//! `agent_paths` names the registry namespaces it may reference; the
//! `uses` key (`namespace:ClassName`) is looked up here instead of being
//! resolved through a filesystem module loader.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::errors::FlowError;

/// The contract every compiled-in agent implements. `input` is the step's
/// `input` mapping, `config` is the step's `config` mapping (already used to
/// construct the agent, passed again here only if the implementation wants
/// to read adjustable per-call overrides from it — most agents ignore it).
#[async_trait]
pub trait DynamicAgent: Send + Sync {
    async fn run(
        &self,
        input: &serde_json::Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<serde_json::Map<String, Value>, FlowError>;
}

type Factory = fn(&serde_json::Map<String, Value>) -> Box<dyn DynamicAgent>;

fn registry() -> &'static HashMap<&'static str, Factory> {
    static REGISTRY: Lazy<HashMap<&'static str, Factory>> = Lazy::new(|| {
        let mut map: HashMap<&'static str, Factory> = HashMap::new();
        map.insert("agents.builtin:EchoAgent", |_config| Box::new(EchoAgent));
        map
    });
    &REGISTRY
}

/// Looks up `uses` (a `namespace:ClassName` key) and constructs the agent
/// with the step's `config`. The namespace half of `uses` must appear in the
/// flow's declared `agent_paths`.
pub fn resolve(uses: &str, agent_paths: &[String], config: &serde_json::Map<String, Value>) -> Result<Box<dyn DynamicAgent>, FlowError> {
    let namespace = uses.split(':').next().unwrap_or_default();
    if !agent_paths.iter().any(|p| p == namespace) {
        return Err(FlowError::StepFailure {
            step_id: uses.to_string(),
            reason: format!("agent namespace '{namespace}' is not declared in this flow's agent_paths"),
        });
    }
    match registry().get(uses) {
        Some(factory) => Ok(factory(config)),
        None => Err(FlowError::StepFailure {
            step_id: uses.to_string(),
            reason: format!("no agent registered for '{uses}'"),
        }),
    }
}

/// Reference agent demonstrating the contract end to end: echoes its input
/// back wrapped under `result`.
pub struct EchoAgent;

#[async_trait]
impl DynamicAgent for EchoAgent {
    async fn run(
        &self,
        input: &serde_json::Map<String, Value>,
        _context: &ExecutionContext,
    ) -> Result<serde_json::Map<String, Value>, FlowError> {
        let mut outcome = serde_json::Map::new();
        outcome.insert("result".to_string(), Value::Object(input.clone()));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_undeclared_namespace() {
        let result = resolve("agents.builtin:EchoAgent", &[], &Default::default());
        assert!(result.is_err());
    }

    #[test]
    fn resolve_finds_builtin_echo_agent() {
        let result = resolve(
            "agents.builtin:EchoAgent",
            &["agents.builtin".to_string()],
            &Default::default(),
        );
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn echo_agent_wraps_input_under_result() {
        let agent = EchoAgent;
        let mut input = serde_json::Map::new();
        input.insert("text".to_string(), Value::String("hi".to_string()));
        let context = ExecutionContext::new(
            "run".to_string(),
            std::path::PathBuf::from("."),
            std::path::PathBuf::from("."),
            std::path::PathBuf::from("."),
        );
        let outcome = agent.run(&input, &context).await.unwrap();
        assert_eq!(outcome["result"]["text"], Value::String("hi".to_string()));
    }
}
