//! OpenAI chat-completions provider.

use async_trait::async_trait;
use serde_json::json;

use super::{Provider, ProviderError, ProviderRequest, ProviderResponse};

const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ProviderError::new("api_key must be provided for OpenAiProvider"));
        }
        Ok(Self {
            api_key,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn agenerate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let temperature = request
            .config
            .get("temperature")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        let body = json!({
            "model": request.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": temperature,
        });

        let started = std::time::Instant::now();
        let response = self
            .client
            .post(OPENAI_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(std::time::Duration::from_secs(request.timeout_sec))
            .send()
            .await
            .map_err(|e| ProviderError::retriable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ProviderError::retriable(format!("openai request failed: {status}")));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::retriable(format!("invalid openai response: {e}")))?;

        let choices = data.get("choices").and_then(|c| c.as_array()).cloned().unwrap_or_default();
        let text = choices
            .first()
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let usage = data.get("usage").cloned().unwrap_or(json!({}));

        let mut meta = serde_json::Map::new();
        meta.insert("provider".to_string(), json!(self.name()));
        meta.insert("raw".to_string(), data);

        Ok(ProviderResponse {
            text,
            content: choices,
            meta,
            latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
            token_usage: Some(usage),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_api_key() {
        assert!(OpenAiProvider::new("").is_err());
    }

    #[test]
    fn accepts_nonempty_api_key() {
        assert!(OpenAiProvider::new("sk-test").is_ok());
    }
}
