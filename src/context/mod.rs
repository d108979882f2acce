//! Per-run execution context: where a step may write, its run identity, and
//! the shared handles it needs to call out to the router or resolve agents.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::router::Router;

/// Everything a step needs to run: where it may write, its run identity, and
/// a shared handle to the MCP Router (absent until a flow declares an `mcp`
/// step, present for the lifetime of the run once it does).
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub flow_dir: PathBuf,
    pub mcp_log_dir: PathBuf,
    pub run_env: HashMap<String, String>,
    pub mcp_router: Option<Router>,
    /// Namespaces this run's flow declared in `agent_paths`; gates which
    /// compiled-in agents a `module:ClassName` step may resolve to.
    pub agent_paths: Vec<String>,
}

impl ExecutionContext {
    pub fn new(
        run_id: String,
        run_dir: PathBuf,
        workspace_dir: PathBuf,
        flow_dir: PathBuf,
    ) -> Self {
        let artifacts_dir = run_dir.join("artifacts");
        let mcp_log_dir = run_dir.clone();
        Self {
            run_id,
            run_dir,
            artifacts_dir,
            workspace_dir,
            flow_dir,
            mcp_log_dir,
            run_env: HashMap::new(),
            mcp_router: None,
            agent_paths: Vec::new(),
        }
    }
}

/// Heuristic used to decide whether a string-valued MCP template variable
/// should be resolved as a filesystem path (searched against run dir → flow
/// dir → workspace) or passed through verbatim (URLs, bare numeric tokens,
/// opaque identifiers).
pub fn looks_like_path(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return false;
    }
    if trimmed.starts_with('~') || trimmed.starts_with("./") || trimmed.starts_with("../") {
        return true;
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return true;
    }
    let bytes = trimmed.as_bytes();
    if bytes.len() > 1 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return true; // drive-letter path, e.g. "C:\foo"
    }
    if trimmed.contains('/') || trimmed.contains('\\') {
        return true;
    }
    let path = Path::new(trimmed);
    match path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) if stem.chars().any(|c| c.is_alphabetic()) => true,
        Some(stem) => {
            let normalized: String = stem.chars().filter(|c| *c != '-' && *c != '_').collect();
            !normalized.is_empty() && normalized.chars().any(|c| !c.is_ascii_digit())
        }
        None => false,
    }
}

/// Resolves `value` against `run_dir`, then `flow_dir`, then `workspace_dir`
/// (first existing candidate wins); defaults to the run-dir candidate if none
/// exist yet (the common case of a path that a prior step will create).
pub fn resolve_path_like(value: &str, run_dir: &Path, flow_dir: &Path, workspace_dir: &Path) -> PathBuf {
    let expanded = if let Some(rest) = value.strip_prefix('~') {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(rest.trim_start_matches('/'))
        } else {
            PathBuf::from(value)
        }
    } else {
        PathBuf::from(value)
    };
    if expanded.is_absolute() {
        return expanded;
    }
    for base in [run_dir, flow_dir, workspace_dir] {
        let candidate = base.join(&expanded);
        if candidate.exists() {
            return candidate;
        }
    }
    run_dir.join(&expanded)
}

#[cfg(test)]
mod path_heuristic_tests {
    use super::*;

    #[test]
    fn urls_are_not_paths() {
        assert!(!looks_like_path("https://example.com/api"));
    }

    #[test]
    fn bare_numeric_token_is_not_a_path() {
        assert!(!looks_like_path("12345"));
    }

    #[test]
    fn relative_and_home_prefixes_are_paths() {
        assert!(looks_like_path("./data.json"));
        assert!(looks_like_path("../shared/notes.txt"));
        assert!(looks_like_path("~/inbox.md"));
    }

    #[test]
    fn bare_filename_with_letters_is_a_path() {
        assert!(looks_like_path("report.md"));
        assert!(looks_like_path("README"));
    }

    #[test]
    fn dashed_numeric_stem_is_not_a_path() {
        assert!(!looks_like_path("2024-01-01"));
    }
}
