//! Pure planning: resolving the `only`/`continue_from` selection into an
//! allowed set, a precompleted set, and a topological execution order. No
//! side effects — reused by `flowctl run --dry-run` to print the plan
//! without executing anything.

use std::collections::{HashSet, VecDeque};

use crate::errors::FlowError;
use crate::model::FlowDefinition;

/// The result of planning: which steps will run, which are already done,
/// and the order ready steps are considered in.
#[derive(Debug, Clone)]
pub struct Plan {
    pub allowed: HashSet<String>,
    pub precompleted: HashSet<String>,
    pub order: Vec<String>,
}

/// Transitive closure of `only` over `depends_on`. `None` means every step
/// in the flow is allowed.
pub fn resolve_allowed_ids(flow: &FlowDefinition, only: Option<&[String]>) -> Result<HashSet<String>, FlowError> {
    let known: HashSet<&str> = flow.steps.iter().map(|s| s.id()).collect();
    let deps: std::collections::HashMap<&str, &[String]> =
        flow.steps.iter().map(|s| (s.id(), s.depends_on())).collect();

    let Some(only) = only else {
        return Ok(known.iter().map(|s| s.to_string()).collect());
    };

    let mut allowed = HashSet::new();
    let mut stack: Vec<String> = Vec::new();
    for id in only {
        if !known.contains(id.as_str()) {
            return Err(FlowError::PlanError {
                reason: format!("'only' references unknown step '{id}'"),
            });
        }
        stack.push(id.clone());
    }
    while let Some(id) = stack.pop() {
        if !allowed.insert(id.clone()) {
            continue;
        }
        if let Some(parents) = deps.get(id.as_str()) {
            for parent in parents.iter() {
                stack.push(parent.clone());
            }
        }
    }
    Ok(allowed)
}

/// Steps appearing strictly before `continue_from` in declaration order,
/// restricted to `allowed`. Returns an error if `continue_from` is itself
/// not an allowed, known step.
pub fn resolve_precompleted(
    flow: &FlowDefinition,
    allowed: &HashSet<String>,
    continue_from: Option<&str>,
) -> Result<HashSet<String>, FlowError> {
    let Some(continue_from) = continue_from else {
        return Ok(HashSet::new());
    };
    if !allowed.contains(continue_from) {
        return Err(FlowError::PlanError {
            reason: format!("'continue_from' references unknown or excluded step '{continue_from}'"),
        });
    }

    let mut precompleted = HashSet::new();
    let mut found = false;
    for step in &flow.steps {
        if step.id() == continue_from {
            found = true;
            break;
        }
        if allowed.contains(step.id()) {
            precompleted.insert(step.id().to_string());
        }
    }
    if !found {
        return Err(FlowError::PlanError {
            reason: format!("'continue_from' step '{continue_from}' not found in declaration order"),
        });
    }
    Ok(precompleted)
}

/// Kahn-style topological order over `allowed \ precompleted`. Cycles and
/// unresolved dependencies are programming errors at this point since
/// [`crate::validation::validate_flow`] should have already caught them, but
/// the check is repeated defensively since the planner may run with a
/// subset of steps where validation's whole-flow cycle check doesn't apply.
pub fn plan(flow: &FlowDefinition, only: Option<&[String]>, continue_from: Option<&str>) -> Result<Plan, FlowError> {
    let allowed = resolve_allowed_ids(flow, only)?;
    let precompleted = resolve_precompleted(flow, &allowed, continue_from)?;

    let active: Vec<&str> = flow
        .steps
        .iter()
        .map(|s| s.id())
        .filter(|id| allowed.contains(*id) && !precompleted.contains(*id))
        .collect();
    let active_set: HashSet<&str> = active.iter().copied().collect();

    let mut remaining_deps: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    let mut dependents: std::collections::HashMap<&str, Vec<&str>> = std::collections::HashMap::new();
    for step in &flow.steps {
        if !active_set.contains(step.id()) {
            continue;
        }
        let deps_in_scope: Vec<&str> = step
            .depends_on()
            .iter()
            .map(String::as_str)
            .filter(|d| active_set.contains(d))
            .collect();
        remaining_deps.insert(step.id(), deps_in_scope.len());
        for dep in deps_in_scope {
            dependents.entry(dep).or_default().push(step.id());
        }
    }

    let mut ready: VecDeque<&str> = active
        .iter()
        .copied()
        .filter(|id| remaining_deps.get(id).copied().unwrap_or(0) == 0)
        .collect();

    let mut order = Vec::with_capacity(active.len());
    while let Some(id) = ready.pop_front() {
        order.push(id.to_string());
        if let Some(children) = dependents.get(id) {
            for child in children.iter() {
                if let Some(count) = remaining_deps.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }
    }

    if order.len() != active.len() {
        return Err(FlowError::PlanError {
            reason: "dependency cycle detected during planning".to_string(),
        });
    }

    Ok(Plan {
        allowed,
        precompleted,
        order,
    })
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

    fn flow() -> FlowDefinition {
        FlowDefinition {
            version: 1,
            run: RunConfig::default(),
            agent_paths: vec![],
            steps: vec![
                shell("a", vec![]),
                shell("b", vec!["a"]),
                shell("c", vec!["b"]),
            ],
        }
    }

    #[test]
    fn plans_full_flow_in_dependency_order() {
        let result = plan(&flow(), None, None).unwrap();
        assert_eq!(result.order, vec!["a", "b", "c"]);
    }

    #[test]
    fn only_pulls_in_transitive_dependencies() {
        let only = vec!["c".to_string()];
        let result = plan(&flow(), Some(&only), None).unwrap();
        assert_eq!(result.order, vec!["a", "b", "c"]);
    }

    #[test]
    fn continue_from_marks_prior_steps_precompleted() {
        let result = plan(&flow(), None, Some("b")).unwrap();
        assert_eq!(result.order, vec!["b", "c"]);
        assert!(result.precompleted.contains("a"));
    }

    #[test]
    fn unknown_only_id_is_an_error() {
        let only = vec!["ghost".to_string()];
        assert!(plan(&flow(), Some(&only), None).is_err());
    }

    #[test]
    fn unknown_continue_from_is_an_error() {
        assert!(plan(&flow(), None, Some("ghost")).is_err());
    }
}
