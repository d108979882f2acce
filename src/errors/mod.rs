//! Structured error types shared across the flow runner, the MCP router, and
//! the skill execution guard.
//!
//! Every fallible operation in this crate eventually produces a [`FlowError`].
//! Library code matches on the enum variant (for example, the skill guard's
//! `reason()` is used verbatim in blocked-step telemetry); CLI-boundary code
//! just prints the `Display` impl and maps it to a process exit code.

use std::fmt;

use thiserror::Error;

/// The reason a skill execution attempt was blocked, matching the precondition
/// chain documented for the Skill Execution Guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillBlockReason {
    SkillsExecDisabled,
    SkillNotAllowExec,
    MissingAllowlistEntry,
    HashMismatch,
    ArgsNotAllowed,
    ScriptNotFound,
    PermissionDenied,
    OutsideWorkspace,
    NonZeroExit,
}

impl SkillBlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SkillsExecDisabled => "skills_exec_disabled",
            Self::SkillNotAllowExec => "skill_not_allow_exec",
            Self::MissingAllowlistEntry => "missing_allowlist_entry",
            Self::HashMismatch => "hash_mismatch",
            Self::ArgsNotAllowed => "args_not_allowed",
            Self::ScriptNotFound => "script_not_found",
            Self::PermissionDenied => "permission_denied",
            Self::OutsideWorkspace => "outside_workspace",
            Self::NonZeroExit => "non_zero_exit",
        }
    }
}

impl fmt::Display for SkillBlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Top-level error kind for every stage of a run, from loading a flow file to
/// a provider call made through the MCP Router.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The flow file could not be parsed or failed schema validation.
    #[error("failed to load flow '{path}': {reason}")]
    LoadError { path: String, reason: String },

    /// Planning failed: a cycle, an unknown dependency, or an unknown
    /// `only`/`continue_from` id.
    #[error("failed to plan flow: {reason}")]
    PlanError { reason: String },

    /// A step did not finish within its configured `timeout_sec`.
    #[error("step '{step_id}' timed out after {timeout_sec}s")]
    StepTimeout { step_id: String, timeout_sec: u64 },

    /// A step's terminal attempt failed (non-zero exit, provider error, etc).
    #[error("step '{step_id}' failed: {reason}")]
    StepFailure { step_id: String, reason: String },

    /// The MCP Router refused a request before dispatch because the estimated
    /// prompt size would not fit within `prompt_limit - prompt_buffer`.
    #[error("prompt requires {required_tokens} tokens but limit minus buffer is {available_tokens}")]
    PromptLimitExceeded {
        required_tokens: u64,
        available_tokens: i64,
    },

    /// A provider call failed. `retriable` mirrors the provider's own hint.
    #[error("provider '{provider}' error: {reason}")]
    ProviderError { provider: String, reason: String, retriable: bool },

    /// The Skill Execution Guard refused to run a script.
    #[error("skill execution blocked ({reason}): {detail}")]
    SkillBlocked { reason: SkillBlockReason, detail: String },

    /// At least one non-`continue_on_error` step failed; the run as a whole
    /// did not succeed.
    #[error("run failed: {0}")]
    FatalExecution(String),
}

impl FlowError {
    pub fn is_retriable(&self) -> bool {
        match self {
            FlowError::StepTimeout { .. } => true,
            FlowError::StepFailure { .. } => true,
            FlowError::ProviderError { retriable, .. } => *retriable,
            FlowError::LoadError { .. }
            | FlowError::PlanError { .. }
            | FlowError::PromptLimitExceeded { .. }
            | FlowError::SkillBlocked { .. }
            | FlowError::FatalExecution(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_limit_message_matches_contract() {
        let err = FlowError::PromptLimitExceeded {
            required_tokens: 64,
            available_tokens: 24,
        };
        let msg = err.to_string();
        assert!(msg.contains("requires 64 tokens"));
        assert!(msg.contains("limit minus buffer is 24"));
    }

    #[test]
    fn non_retriable_kinds_never_retry() {
        assert!(!FlowError::PlanError { reason: "cycle".into() }.is_retriable());
        assert!(!FlowError::SkillBlocked {
            reason: SkillBlockReason::HashMismatch,
            detail: "script.sh".into(),
        }
        .is_retriable());
    }

    #[test]
    fn provider_error_retriable_follows_hint() {
        let retriable = FlowError::ProviderError {
            provider: "openai".into(),
            reason: "timeout".into(),
            retriable: true,
        };
        assert!(retriable.is_retriable());
    }
}
