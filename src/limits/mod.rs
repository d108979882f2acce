//! Execution limits: guard rails against malformed or runaway flows.
//!
//! | Limit               | Default | Description                          |
//! |----------------------|--------|--------------------------------------|
//! | max_steps            | 100    | Max steps allowed in a flow          |
//! | max_parallel          | 10     | Max steps running concurrently       |
//! | max_retries_total     | 50     | Max retries across the whole run     |
//! | max_execution_secs    | 300    | Whole-run timeout (5 min)            |
//! | max_step_timeout      | 30     | Per-step timeout ceiling (seconds)   |

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_STEPS: usize = 100;
pub const DEFAULT_MAX_PARALLEL: usize = 10;
pub const DEFAULT_MAX_RETRIES_TOTAL: u32 = 50;
pub const DEFAULT_MAX_EXECUTION_SECS: u64 = 300;
pub const DEFAULT_MAX_STEP_TIMEOUT_SECS: u64 = 30;

/// Execution limits, loadable from environment or CLI flags. Every field has
/// a safe default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Max steps in a flow; the run is rejected at validation if exceeded.
    pub max_steps: usize,
    /// Max steps the runner will have in flight at once.
    pub max_parallel: usize,
    /// Max retries summed across every step in the run.
    pub max_retries_total: u32,
    /// Whole-run timeout; the run is aborted after this elapses.
    pub max_execution_time: Duration,
    /// Ceiling applied to a step's own `timeout_sec`, whichever is smaller.
    pub max_step_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_retries_total: DEFAULT_MAX_RETRIES_TOTAL,
            max_execution_time: Duration::from_secs(DEFAULT_MAX_EXECUTION_SECS),
            max_step_timeout: Duration::from_secs(DEFAULT_MAX_STEP_TIMEOUT_SECS),
        }
    }
}

impl ExecutionLimits {
    /// Reads overrides from `FLOWCTL_MAX_STEPS`, `FLOWCTL_MAX_PARALLEL`,
    /// `FLOWCTL_MAX_RETRIES`, `FLOWCTL_MAX_EXECUTION_SECS`,
    /// `FLOWCTL_MAX_STEP_TIMEOUT`.
    pub fn from_env() -> Self {
        let mut limits = Self::default();

        if let Ok(val) = std::env::var("FLOWCTL_MAX_STEPS") {
            if let Ok(n) = val.parse() {
                limits.max_steps = n;
            }
        }
        if let Ok(val) = std::env::var("FLOWCTL_MAX_PARALLEL") {
            if let Ok(n) = val.parse() {
                limits.max_parallel = n;
            }
        }
        if let Ok(val) = std::env::var("FLOWCTL_MAX_RETRIES") {
            if let Ok(n) = val.parse() {
                limits.max_retries_total = n;
            }
        }
        if let Ok(val) = std::env::var("FLOWCTL_MAX_EXECUTION_SECS") {
            if let Ok(n) = val.parse() {
                limits.max_execution_time = Duration::from_secs(n);
            }
        }
        if let Ok(val) = std::env::var("FLOWCTL_MAX_STEP_TIMEOUT") {
            if let Ok(n) = val.parse() {
                limits.max_step_timeout = Duration::from_secs(n);
            }
        }

        limits
    }

    pub fn strict() -> Self {
        Self {
            max_steps: 10,
            max_parallel: 2,
            max_retries_total: 5,
            max_execution_time: Duration::from_secs(30),
            max_step_timeout: Duration::from_secs(5),
        }
    }

    pub fn relaxed() -> Self {
        Self {
            max_steps: 500,
            max_parallel: 50,
            max_retries_total: 200,
            max_execution_time: Duration::from_secs(3600),
            max_step_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
pub struct LimitValidationResult {
    pub passed: bool,
    pub violations: Vec<LimitViolation>,
}

#[derive(Debug, Clone)]
pub struct LimitViolation {
    pub limit_name: String,
    pub limit_value: String,
    pub actual_value: String,
    pub message: String,
}

/// Checks a flow's step count and total possible retries against `limits`.
pub fn validate_limits(step_count: usize, total_retries: u32, limits: &ExecutionLimits) -> LimitValidationResult {
    let mut violations = Vec::new();

    if step_count > limits.max_steps {
        violations.push(LimitViolation {
            limit_name: "max_steps".to_string(),
            limit_value: limits.max_steps.to_string(),
            actual_value: step_count.to_string(),
            message: format!(
                "flow has {} steps, max allowed is {}",
                step_count, limits.max_steps
            ),
        });
    }

    if total_retries > limits.max_retries_total {
        violations.push(LimitViolation {
            limit_name: "max_retries_total".to_string(),
            limit_value: limits.max_retries_total.to_string(),
            actual_value: total_retries.to_string(),
            message: format!(
                "flow can retry up to {} times, max allowed is {}",
                total_retries, limits.max_retries_total
            ),
        });
    }

    LimitValidationResult {
        passed: violations.is_empty(),
        violations,
    }
}

/// Tracks retries made during a run and refuses once the cross-run total is
/// exceeded, independent of any single step's own `retries` count.
#[derive(Debug, Default)]
pub struct RetryCounter {
    count: std::sync::atomic::AtomicU32,
    limit: u32,
}

impl RetryCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            count: std::sync::atomic::AtomicU32::new(0),
            limit,
        }
    }

    /// Returns `true` if the retry is still within budget.
    pub fn try_increment(&self) -> bool {
        let current = self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        current < self.limit
    }

    pub fn current(&self) -> u32 {
        self.count.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_documented_constants() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.max_steps, 100);
        assert_eq!(limits.max_parallel, 10);
        assert_eq!(limits.max_retries_total, 50);
    }

    #[test]
    fn strict_limits_are_tighter_than_default() {
        let limits = ExecutionLimits::strict();
        assert_eq!(limits.max_steps, 10);
        assert_eq!(limits.max_parallel, 2);
    }

    #[test]
    fn validate_limits_passes_within_budget() {
        let limits = ExecutionLimits::default();
        let result = validate_limits(50, 20, &limits);
        assert!(result.passed);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn validate_limits_flags_step_count_overrun() {
        let limits = ExecutionLimits::default();
        let result = validate_limits(150, 20, &limits);
        assert!(!result.passed);
        assert_eq!(result.violations[0].limit_name, "max_steps");
    }

    #[test]
    fn validate_limits_flags_retry_overrun() {
        let limits = ExecutionLimits::default();
        let result = validate_limits(10, 100, &limits);
        assert!(!result.passed);
        assert_eq!(result.violations[0].limit_name, "max_retries_total");
    }

    #[test]
    fn retry_counter_refuses_past_limit() {
        let counter = RetryCounter::new(3);
        assert!(counter.try_increment());
        assert!(counter.try_increment());
        assert!(counter.try_increment());
        assert!(!counter.try_increment());
        assert_eq!(counter.current(), 4);
    }
}
