//! Environment-driven configuration for the runner, the MCP Router, and the
//! skill execution guard. Every setting has a safe default and can be
//! overridden via an environment variable, following the same
//! `from_env()` convention used by [`crate::telemetry::TelemetryConfig`].

use std::time::Duration;

/// Settings that govern a single flow run: where run directories are rooted
/// and how often the JSONL writer flushes.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root directory under which `run.output_dir` templates are resolved
    /// when the flow's `output_dir` is itself relative.
    pub base_output_dir: Option<String>,
    /// Lines between forced flushes of `runs.jsonl`. Forced to `1` in
    /// dev-fast mode regardless of this value.
    pub log_flush_every: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_output_dir: None,
            log_flush_every: 50,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("FLOWCTL_BASE_OUTPUT_DIR") {
            config.base_output_dir = Some(dir);
        }
        if let Ok(n) = std::env::var("FLOWCTL_LOG_FLUSH_EVERY") {
            if let Ok(n) = n.parse::<usize>() {
                config.log_flush_every = n.max(1);
            }
        }
        config
    }
}

/// Settings that govern the MCP Router's worker pool, retry policy, and
/// provider selection.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_sessions: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub log_flush_every: usize,
    pub openai_api_key: Option<String>,
    pub github_token: Option<String>,
    /// `true` when `ENV=production`; hardens provider selection by refusing
    /// to fall back to the dummy provider.
    pub production: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            request_timeout: Duration::from_secs_f64(30.0),
            max_retries: 1,
            backoff_base: Duration::from_secs_f64(0.5),
            log_flush_every: 50,
            openai_api_key: None,
            github_token: None,
            production: false,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(n) = std::env::var("MCP_MAX_SESSIONS") {
            if let Ok(n) = n.parse::<usize>() {
                config.max_sessions = n.max(1);
            }
        }
        if let Ok(s) = std::env::var("MCP_REQUEST_TIMEOUT_SEC") {
            if let Ok(s) = s.parse::<f64>() {
                config.request_timeout = Duration::from_secs_f64(s.max(0.0));
            }
        }
        if let Ok(n) = std::env::var("MCP_MAX_RETRIES") {
            if let Ok(n) = n.parse::<u32>() {
                config.max_retries = n;
            }
        }
        if let Ok(s) = std::env::var("MCP_BACKOFF_BASE_SEC") {
            if let Ok(s) = s.parse::<f64>() {
                config.backoff_base = Duration::from_secs_f64(s.max(0.0));
            }
        }
        if let Ok(n) = std::env::var("MCP_LOG_FLUSH_EVERY") {
            if let Ok(n) = n.parse::<usize>() {
                config.log_flush_every = n.max(1);
            }
        }
        config.openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        config.github_token = std::env::var("GITHUB_TOKEN").ok();
        config.production = std::env::var("ENV").map(|v| v == "production").unwrap_or(false);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.log_flush_every, 50);
        assert!(config.base_output_dir.is_none());
    }

    #[test]
    fn router_config_defaults_match_contract() {
        let config = RouterConfig::default();
        assert_eq!(config.max_sessions, 5);
        assert_eq!(config.request_timeout, Duration::from_secs_f64(30.0));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.backoff_base, Duration::from_secs_f64(0.5));
    }
}
