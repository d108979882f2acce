//! GitHub REST/GraphQL provider. Unlike the LLM providers this has no token
//! concept, so `token_usage` is always a zeroed placeholder.

use async_trait::async_trait;
use serde_json::json;

use super::{Provider, ProviderError, ProviderRequest, ProviderResponse};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "flowctl-mcp-router/1.0";

pub struct GitHubProvider {
    token: String,
    base_url: String,
    client: reqwest::Client,
}

impl GitHubProvider {
    pub fn new(token: impl Into<String>) -> Result<Self, ProviderError> {
        let token = token.into();
        if token.is_empty() {
            return Err(ProviderError::new("token must be provided for GitHubProvider"));
        }
        Ok(Self {
            token,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn resolve_path(&self, request: &ProviderRequest) -> Result<String, ProviderError> {
        let from_config = request
            .config
            .get("path")
            .or_else(|| request.config.get("api_path"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let path = from_config.unwrap_or_else(|| request.prompt.clone());
        if path.trim().is_empty() {
            return Err(ProviderError::new("no path/prompt provided for GitHub request"));
        }
        if path.starts_with("http://") || path.starts_with("https://") {
            Ok(path)
        } else if path.starts_with('/') {
            Ok(format!("{}{}", self.base_url, path))
        } else {
            Ok(format!("{}/{}", self.base_url, path))
        }
    }
}

#[async_trait]
impl Provider for GitHubProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn agenerate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let graphql = request
            .config
            .get("graphql")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let method = request
            .config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or(if graphql { "POST" } else { "GET" })
            .to_uppercase();

        let url = if graphql {
            format!("{}/graphql", self.base_url)
        } else {
            self.resolve_path(&request)?
        };

        let mut builder = self
            .client
            .request(
                method.parse().map_err(|_| ProviderError::new(format!("invalid method: {method}")))?,
                url,
            )
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", USER_AGENT)
            .timeout(std::time::Duration::from_secs(request.timeout_sec));

        if graphql {
            let query = request
                .config
                .get("query")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| request.prompt.clone());
            let variables = request.config.get("variables").cloned().unwrap_or(json!({}));
            builder = builder.json(&json!({"query": query, "variables": variables}));
        } else if let Some(json_body) = request.config.get("json") {
            builder = builder.json(json_body);
        } else if let Some(params) = request.config.get("params") {
            builder = builder.query(params);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::retriable(e.to_string()))?;

        let status = response.status();
        let remaining = response
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let reset = response
            .headers()
            .get("X-RateLimit-Reset")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if !status.is_success() {
            let retriable = status.as_u16() >= 500 && status.as_u16() < 600;
            let err = ProviderError {
                message: format!("github request failed: {status}"),
                retriable,
            };
            return Err(err);
        }

        let data: serde_json::Value = response
            .json()
            .await
            .unwrap_or(serde_json::Value::Null);

        let mut meta = serde_json::Map::new();
        meta.insert("provider".to_string(), json!(self.name()));
        if let Some(remaining) = remaining {
            meta.insert("rate_limit_remaining".to_string(), json!(remaining));
        }
        if let Some(reset) = reset {
            meta.insert("rate_limit_reset".to_string(), json!(reset));
        }

        let token_usage = json!({"tokens": {"input": 0, "output": 0, "total": 0}});

        Ok(ProviderResponse {
            text: data.to_string(),
            content: vec![data],
            meta,
            latency_ms: None,
            token_usage: Some(token_usage),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_token() {
        assert!(GitHubProvider::new("").is_err());
    }

    #[test]
    fn resolve_path_prefers_config_path() {
        let provider = GitHubProvider::new("ghp_test").unwrap();
        let request = ProviderRequest {
            prompt: "ignored".into(),
            model: "n/a".into(),
            sandbox: "read-only".into(),
            approval_policy: "never".into(),
            config: serde_json::from_value(json!({"path": "/repos/foo/bar"})).unwrap(),
            timeout_sec: 15,
        };
        let resolved = provider.resolve_path(&request).unwrap();
        assert_eq!(resolved, "https://api.github.com/repos/foo/bar");
    }
}
