//! MCP Router: a synchronous-feeling facade (`generate()` is an `async fn`
//! the caller simply awaits) over a bounded pool of cooperative workers that
//! dispatch calls to a single pluggable [`providers::Provider`].
//!
//! Every admitted request is queued; a fixed number of worker permits bound
//! how many provider calls run concurrently. Every attempt — admitted or
//! refused, successful or failed — is written to `mcp_calls.jsonl`.

pub mod providers;

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{oneshot, Semaphore};

use crate::config::RouterConfig;
use crate::errors::FlowError;
use crate::jsonl::AsyncLineWriter;
use crate::model::McpAuditRecord;
use crate::redactor::mask_sensitive;
use crate::retry::router_backoff;

use providers::{dummy::DummyProvider, github::GitHubProvider, openai::OpenAiProvider, Provider, ProviderRequest};

/// A single `generate()` call, parameterized the way a flow's `mcp` step
/// declares it.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    pub prompt_limit: u64,
    pub prompt_buffer: u64,
    pub sandbox: String,
    pub approval_policy: String,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub timeout_sec: u64,
    pub retries: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    pub content: Vec<serde_json::Value>,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

struct QueueItem {
    request: GenerateRequest,
    respond_to: oneshot::Sender<Result<GenerateResponse, FlowError>>,
}

struct Inner {
    sender: tokio::sync::mpsc::UnboundedSender<QueueItem>,
    audit: Arc<StdMutex<AsyncLineWriter>>,
}

/// Cheaply cloneable handle to a running router; every clone shares the same
/// worker pool, queue, and audit log.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    /// Builds a router from explicit settings and an already-constructed
    /// provider. Mainly useful for tests; production code should prefer
    /// [`Router::from_env`].
    pub fn new(config: RouterConfig, provider: Arc<dyn Provider>, audit_log_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let audit = Arc::new(StdMutex::new(AsyncLineWriter::open(
            audit_log_path,
            config.log_flush_every,
        )?));
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel::<QueueItem>();

        let semaphore = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        let worker_config = config.clone();
        let worker_audit = audit.clone();
        tokio::spawn(dispatch_loop(receiver, provider, semaphore, worker_config, worker_audit));

        Ok(Self {
            inner: Arc::new(Inner { sender, audit }),
        })
    }

    /// Resolves provider selection from the environment the way the source
    /// system does: OpenAI if `OPENAI_API_KEY` is set, otherwise Dummy
    /// unless `ENV=production`, in which case construction fails outright.
    pub fn from_env(run_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = RouterConfig::from_env();
        let provider: Arc<dyn Provider> = if let Some(key) = &config.openai_api_key {
            Arc::new(OpenAiProvider::new(key.clone())?)
        } else if let Some(token) = &config.github_token {
            Arc::new(GitHubProvider::new(token.clone())?)
        } else if config.production {
            anyhow::bail!("no provider credentials configured and ENV=production");
        } else {
            Arc::new(DummyProvider::new())
        };
        let audit_path = run_dir.as_ref().join("mcp_calls.jsonl");
        Ok(Self::new(config, provider, audit_path)?)
    }

    /// Estimates the prompt's token cost, checks it against
    /// `prompt_limit - prompt_buffer`, and — only if admission passes —
    /// enqueues the request and awaits the worker's response.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, FlowError> {
        let approx_tokens = providers::approx_token_usage(&request.prompt);
        let available = request.prompt_limit as i64 - request.prompt_buffer as i64;
        if approx_tokens as i64 > available {
            self.log_audit(McpAuditRecord {
                ts: now_iso(),
                model: request.model.clone(),
                worker: None,
                latency_ms: 0.0,
                prompt_chars: request.prompt.chars().count(),
                token_usage: json!({"tokens": approx_tokens}),
                status: "prompt_limit_exceeded".to_string(),
                error: Some(format!(
                    "prompt requires {approx_tokens} tokens but limit minus buffer is {available}"
                )),
            });
            return Err(FlowError::PromptLimitExceeded {
                required_tokens: approx_tokens,
                available_tokens: available,
            });
        }

        let (respond_to, receiver) = oneshot::channel();
        self.inner
            .sender
            .send(QueueItem { request, respond_to })
            .map_err(|_| FlowError::FatalExecution("mcp router worker pool is shut down".into()))?;

        receiver
            .await
            .map_err(|_| FlowError::FatalExecution("mcp router dropped a request without responding".into()))?
    }

    fn log_audit(&self, record: McpAuditRecord) {
        let value = mask_sensitive(&serde_json::to_value(&record).unwrap_or(serde_json::Value::Null));
        if let Ok(line) = serde_json::to_string(&value) {
            if let Ok(writer) = self.inner.audit.lock() {
                writer.write_line(line);
            }
        }
    }
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

async fn dispatch_loop(
    mut receiver: tokio::sync::mpsc::UnboundedReceiver<QueueItem>,
    provider: Arc<dyn Provider>,
    semaphore: Arc<Semaphore>,
    config: RouterConfig,
    audit: Arc<StdMutex<AsyncLineWriter>>,
) {
    while let Some(item) = receiver.recv().await {
        let provider = provider.clone();
        let semaphore = semaphore.clone();
        let config = config.clone();
        let audit = audit.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = execute_with_retry(provider.as_ref(), &item.request, &config, &audit).await;
            let _ = item.respond_to.send(result);
        });
    }
}

async fn execute_with_retry(
    provider: &dyn Provider,
    request: &GenerateRequest,
    config: &RouterConfig,
    audit: &Arc<StdMutex<AsyncLineWriter>>,
) -> Result<GenerateResponse, FlowError> {
    let attempts = request.retries.unwrap_or(config.max_retries) + 1;
    let mut last_error: Option<FlowError> = None;

    for attempt in 0..attempts {
        let started = std::time::Instant::now();
        let provider_request = ProviderRequest {
            prompt: request.prompt.clone(),
            model: request.model.clone(),
            sandbox: request.sandbox.clone(),
            approval_policy: request.approval_policy.clone(),
            config: request.config.clone(),
            timeout_sec: request.timeout_sec,
        };

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(request.timeout_sec.max(1)),
            provider.agenerate(provider_request),
        )
        .await;

        let (status, error_text, response) = match outcome {
            Ok(Ok(response)) => ("ok", None, Some(response)),
            Ok(Err(provider_err)) => ("error", Some(provider_err.message.clone()), None),
            Err(_) => ("error", Some(format!("provider timed out after {}s", request.timeout_sec)), None),
        };

        let latency_ms = response
            .as_ref()
            .and_then(|r| r.latency_ms)
            .unwrap_or_else(|| started.elapsed().as_secs_f64() * 1000.0);

        write_audit(
            audit,
            McpAuditRecord {
                ts: now_iso(),
                model: request.model.clone(),
                worker: None,
                latency_ms,
                prompt_chars: request.prompt.chars().count(),
                token_usage: response
                    .as_ref()
                    .and_then(|r| r.token_usage.clone())
                    .unwrap_or(serde_json::Value::Null),
                status: status.to_string(),
                error: error_text.clone(),
            },
        );

        if let Some(mut response) = response {
            let token_usage = response
                .token_usage
                .clone()
                .unwrap_or(serde_json::Value::Null);
            response.meta.entry("provider").or_insert_with(|| json!(provider.name()));
            response.meta.insert("retries".to_string(), json!(attempt));
            response.meta.insert("token_usage".to_string(), token_usage);
            response.meta.insert("latency_ms".to_string(), json!(latency_ms));
            return Ok(GenerateResponse {
                text: response.text,
                content: response.content,
                meta: response.meta,
            });
        }

        let retriable = matches!(outcome_retriable(&outcome), true);
        last_error = Some(FlowError::ProviderError {
            provider: provider.name().to_string(),
            reason: error_text.unwrap_or_default(),
            retriable,
        });

        if attempt + 1 < attempts && retriable {
            tokio::time::sleep(router_backoff(config.backoff_base, attempt)).await;
            continue;
        }
        break;
    }

    Err(last_error.unwrap_or_else(|| FlowError::ProviderError {
        provider: provider.name().to_string(),
        reason: "unknown provider error".to_string(),
        retriable: false,
    }))
}

fn outcome_retriable(
    outcome: &Result<Result<providers::ProviderResponse, providers::ProviderError>, tokio::time::error::Elapsed>,
) -> bool {
    match outcome {
        Ok(Err(err)) => err.retriable,
        Err(_) => true, // timeouts are always worth retrying
        Ok(Ok(_)) => false,
    }
}

fn write_audit(audit: &Arc<StdMutex<AsyncLineWriter>>, record: McpAuditRecord) {
    let value = mask_sensitive(&serde_json::to_value(&record).unwrap_or(serde_json::Value::Null));
    if let Ok(line) = serde_json::to_string(&value) {
        if let Ok(writer) = audit.lock() {
            writer.write_line(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use providers::ProviderError;

    struct AlwaysFails;

    #[async_trait::async_trait]
    impl Provider for AlwaysFails {
        fn name(&self) -> &'static str {
            "always-fails"
        }
        async fn agenerate(&self, _req: ProviderRequest) -> Result<providers::ProviderResponse, ProviderError> {
            Err(ProviderError::new("boom"))
        }
    }

    #[tokio::test]
    async fn generate_rejects_oversized_prompt_without_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(DummyProvider::new());
        let router = Router::new(RouterConfig::default(), provider, dir.path().join("mcp_calls.jsonl")).unwrap();

        let result = router
            .generate(GenerateRequest {
                prompt: "x".repeat(800),
                model: "dummy".into(),
                prompt_limit: 32,
                prompt_buffer: 8,
                sandbox: "read-only".into(),
                approval_policy: "never".into(),
                config: Default::default(),
                timeout_sec: 5,
                retries: None,
            })
            .await;

        assert!(matches!(result, Err(FlowError::PromptLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn generate_succeeds_against_dummy_provider() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(DummyProvider::new());
        let router = Router::new(RouterConfig::default(), provider, dir.path().join("mcp_calls.jsonl")).unwrap();

        let result = router
            .generate(GenerateRequest {
                prompt: "hello".into(),
                model: "dummy".into(),
                prompt_limit: 4096,
                prompt_buffer: 0,
                sandbox: "read-only".into(),
                approval_policy: "never".into(),
                config: Default::default(),
                timeout_sec: 5,
                retries: None,
            })
            .await
            .unwrap();

        assert!(result.text.contains("model=dummy"));
    }

    #[tokio::test]
    async fn non_retriable_provider_error_surfaces_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(AlwaysFails);
        let router = Router::new(RouterConfig::default(), provider, dir.path().join("mcp_calls.jsonl")).unwrap();

        let result = router
            .generate(GenerateRequest {
                prompt: "hello".into(),
                model: "dummy".into(),
                prompt_limit: 4096,
                prompt_buffer: 0,
                sandbox: "read-only".into(),
                approval_policy: "never".into(),
                config: Default::default(),
                timeout_sec: 5,
                retries: Some(2),
            })
            .await;

        assert!(matches!(result, Err(FlowError::ProviderError { retriable: false, .. })));
    }
}
