//! Step execution: one [`StepExecutor`] implementation per `uses` kind.
//! Kept polymorphic only over `run(context) -> outcome`, so the DAG executor
//! never needs to know which kind of step it is driving.

pub mod agent;
pub mod mcp;
pub mod shell;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::errors::FlowError;
use crate::model::StepSpec;

/// The value a successful step attempt produces; becomes the `extra` field
/// of the terminal `end` event.
pub type StepOutcome = serde_json::Map<String, Value>;

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(&self, spec: &StepSpec, context: &ExecutionContext) -> Result<StepOutcome, FlowError>;
}

/// Dispatches a step spec to the executor matching its `uses` kind.
pub fn executor_for(spec: &StepSpec) -> Box<dyn StepExecutor> {
    match spec {
        StepSpec::Shell(_) => Box::new(shell::ShellExecutor),
        StepSpec::Mcp(_) => Box::new(mcp::McpExecutor),
        StepSpec::Agent(_) => Box::new(agent::AgentExecutor),
    }
}
