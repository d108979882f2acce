//! Offline echo provider: used whenever no real API key is configured and
//! `ENV != production`.

use async_trait::async_trait;
use serde_json::json;

use super::{Provider, ProviderError, ProviderRequest, ProviderResponse};

pub struct DummyProvider;

impl DummyProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DummyProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for DummyProvider {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn agenerate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let preview: String = request.prompt.chars().take(160).collect();
        let text = format!(
            "model={}\nsandbox={}\napproval_policy={}\nprompt_preview={}",
            request.model, request.sandbox, request.approval_policy, preview
        );

        let token_usage = json!({"tokens": {"input": 0, "output": 0, "total": 0}});
        let mut meta = serde_json::Map::new();
        meta.insert("provider".to_string(), json!(self.name()));
        meta.insert("config".to_string(), json!(request.config));
        meta.insert("token_usage".to_string(), token_usage.clone());

        Ok(ProviderResponse {
            text,
            content: vec![],
            meta,
            latency_ms: Some(10.0),
            token_usage: Some(token_usage),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_model_and_sandbox() {
        let provider = DummyProvider::new();
        let response = provider
            .agenerate(ProviderRequest {
                prompt: "hello world".into(),
                model: "gpt-4".into(),
                sandbox: "read-only".into(),
                approval_policy: "never".into(),
                config: Default::default(),
                timeout_sec: 30,
            })
            .await
            .unwrap();

        assert!(response.text.contains("model=gpt-4"));
        assert!(response.text.contains("sandbox=read-only"));
        assert_eq!(response.latency_ms, Some(10.0));
    }
}
