//! Structural validation of a loaded [`FlowDefinition`]: duplicate ids,
//! empty ids, unknown dependencies, dependency cycles, and per-step field
//! invariants. Runs unconditionally, even in dev-fast mode — only the
//! separate JSON-Schema check in [`crate::loader`] is dev-fast-gated.

use std::collections::{HashMap, HashSet};

use crate::errors::FlowError;
use crate::model::FlowDefinition;

pub fn validate_flow(flow: &FlowDefinition) -> Result<(), FlowError> {
    if flow.steps.is_empty() {
        return Err(FlowError::LoadError {
            path: String::new(),
            reason: "flow has no steps".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for step in &flow.steps {
        let id = step.id();
        if id.trim().is_empty() {
            return Err(FlowError::LoadError {
                path: String::new(),
                reason: "a step has an empty id".to_string(),
            });
        }
        if !seen.insert(id.to_string()) {
            return Err(FlowError::LoadError {
                path: String::new(),
                reason: format!("duplicate step id '{id}'"),
            });
        }
        if step.common().timeout_sec < 1 {
            return Err(FlowError::LoadError {
                path: String::new(),
                reason: format!("step '{id}' has timeout_sec < 1"),
            });
        }
    }

    let known: HashSet<&str> = flow.steps.iter().map(|s| s.id()).collect();
    for step in &flow.steps {
        for dep in step.depends_on() {
            if !known.contains(dep.as_str()) {
                return Err(FlowError::LoadError {
                    path: String::new(),
                    reason: format!("step '{}' depends on unknown step '{}'", step.id(), dep),
                });
            }
        }
    }

    detect_cycle(flow)?;

    for step in &flow.steps {
        if let crate::model::StepSpec::Mcp(mcp) = step {
            if mcp.policy.prompt_buffer >= mcp.policy.prompt_limit {
                return Err(FlowError::LoadError {
                    path: String::new(),
                    reason: format!(
                        "step '{}' has prompt_buffer >= prompt_limit",
                        mcp.common.id
                    ),
                });
            }
        }
    }

    Ok(())
}

fn detect_cycle(flow: &FlowDefinition) -> Result<(), FlowError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let deps: HashMap<&str, &[String]> = flow
        .steps
        .iter()
        .map(|s| (s.id(), s.depends_on()))
        .collect();
    let mut marks: HashMap<&str, Mark> = flow.steps.iter().map(|s| (s.id(), Mark::Unvisited)).collect();

    fn visit<'a>(
        id: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), FlowError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                return Err(FlowError::PlanError {
                    reason: format!("dependency cycle detected at step '{id}'"),
                })
            }
            _ => {}
        }
        marks.insert(id, Mark::InProgress);
        if let Some(children) = deps.get(id) {
            for child in children.iter() {
                visit(child, deps, marks)?;
            }
        }
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for id in flow.steps.iter().map(|s| s.id()) {
        visit(id, &deps, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunConfig, ShellStepSpec, StepCommon, StepSpec};

    fn shell(id: &str, depends_on: Vec<&str>) -> StepSpec {
        StepSpec::Shell(ShellStepSpec {
            common: StepCommon {
                id: id.to_string(),
                continue_on_error: false,
                timeout_sec: 60,
                retries: 0,
                depends_on: depends_on.into_iter().map(str::to_string).collect(),
            },
            run: "true".to_string(),
        })
    }

    fn flow(steps: Vec<StepSpec>) -> FlowDefinition {
        FlowDefinition {
            version: 1,
            run: RunConfig::default(),
            agent_paths: vec![],
            steps,
        }
    }

    #[test]
    fn rejects_empty_flow() {
        assert!(validate_flow(&flow(vec![])).is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let f = flow(vec![shell("a", vec![]), shell("a", vec![])]);
        assert!(validate_flow(&f).is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let f = flow(vec![shell("a", vec!["ghost"])]);
        assert!(validate_flow(&f).is_err());
    }

    #[test]
    fn rejects_cycle() {
        let f = flow(vec![shell("a", vec!["b"]), shell("b", vec!["a"])]);
        assert!(validate_flow(&f).is_err());
    }

    #[test]
    fn accepts_valid_linear_chain() {
        let f = flow(vec![shell("a", vec![]), shell("b", vec!["a"])]);
        assert!(validate_flow(&f).is_ok());
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut step = shell("a", vec![]);
        if let StepSpec::Shell(s) = &mut step {
            s.common.timeout_sec = 0;
        }
        let f = flow(vec![step]);
        assert!(validate_flow(&f).is_err());
    }
}
