//! Provider abstraction: the MCP Router dispatches every admitted request to
//! one `Provider` implementation chosen at construction time.

pub mod dummy;
pub mod github;
pub mod openai;

use async_trait::async_trait;
use serde_json::Value;

/// What the router sends to a provider after admission passes.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub prompt: String,
    pub model: String,
    pub sandbox: String,
    pub approval_policy: String,
    pub config: serde_json::Map<String, Value>,
    pub timeout_sec: u64,
}

/// What a provider returns on success.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub content: Vec<Value>,
    pub meta: serde_json::Map<String, Value>,
    pub latency_ms: Option<f64>,
    pub token_usage: Option<Value>,
}

/// Provider-side failure. `retriable` tells the router's retry loop whether
/// this specific error is worth another attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub retriable: bool,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }

    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn agenerate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// `ascii_chars/4` rounded up plus `non_ascii_chars*2/4` rounded up, floored
/// at 1. Computed with integer ceiling division (`(n + 3) / 4`) to avoid
/// floating point drift, matching the source formula exactly.
pub fn approx_token_usage(prompt: &str) -> u64 {
    let ascii_chars = prompt.chars().filter(|c| (*c as u32) < 128).count() as u64;
    let total_chars = prompt.chars().count() as u64;
    let other_chars = total_chars - ascii_chars;
    let tokens = (ascii_chars + 3) / 4 + (other_chars * 2 + 3) / 4;
    tokens.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_only_prompt() {
        // 16 ascii chars -> ceil(16/4) = 4
        assert_eq!(approx_token_usage("0123456789abcdef"), 4);
    }

    #[test]
    fn empty_prompt_floors_at_one() {
        assert_eq!(approx_token_usage(""), 1);
    }

    #[test]
    fn mixed_ascii_and_non_ascii() {
        // 4 ascii chars + 2 non-ascii chars: ceil(4/4) + ceil(2*2/4) = 1 + 1 = 2
        assert_eq!(approx_token_usage("abcdé€"), 2);
    }

    #[test]
    fn ceiling_division_rounds_up_partial_groups() {
        // 5 ascii chars -> ceil(5/4) = 2
        assert_eq!(approx_token_usage("abcde"), 2);
    }
}
