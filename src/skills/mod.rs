//! Skill Registry & Matcher: indexes `SKILL.md` documents, scores a query
//! against their frontmatter descriptions with a BM25-style ranking
//! (optionally blended with a cosine-similarity embedding cache), and
//! prepares the matched bodies for injection into a prompt.
//!
//! Execution of a matched skill's script is a separate concern, handled by
//! [`guard::SkillExecutionGuard`].

pub mod guard;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::jsonl::AsyncLineWriter;
use crate::redactor::mask_sensitive;

const EMBEDDING_WEIGHT: f64 = 0.7;
const KEYWORD_WEIGHT: f64 = 0.3;
const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    skills: Vec<RegistryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    path: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    allow_exec: bool,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SkillMetadata {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub rel_path: String,
    pub frontmatter_hash: String,
    pub enabled: bool,
    pub allow_exec: bool,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SkillMatch {
    pub metadata: SkillMetadata,
    pub score: f64,
    pub threshold: f64,
    pub keyword_score: f64,
    pub embedding_score: Option<f64>,
}

/// An optional embedding backend. Absent means matching falls back to BM25
/// alone, exactly as the keyword-only path in the source implementation.
pub trait Embedder {
    fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

pub struct SkillManager {
    root: PathBuf,
    enabled: bool,
    exec_enabled: bool,
    top_k: usize,
    threshold: f64,
    telemetry: AsyncLineWriter,
    metadata_by_path: HashMap<String, SkillMetadata>,
    embeddings: HashMap<String, Vec<f32>>,
    bm25_index: HashMap<String, HashMap<String, f64>>,
    avg_doc_len: f64,
    embedder: Option<Box<dyn Embedder + Send + Sync>>,
}

impl SkillManager {
    pub fn new(
        root: impl Into<PathBuf>,
        enabled: bool,
        exec_enabled: bool,
        telemetry_path: impl AsRef<Path>,
        flush_every: usize,
    ) -> std::io::Result<Self> {
        let root = root.into();
        let telemetry = AsyncLineWriter::open(telemetry_path, flush_every)?;
        let mut manager = Self {
            root,
            enabled,
            exec_enabled,
            top_k: 3,
            threshold: 0.75,
            telemetry,
            metadata_by_path: HashMap::new(),
            embeddings: HashMap::new(),
            bm25_index: HashMap::new(),
            avg_doc_len: 0.0,
            embedder: None,
        };
        if manager.enabled {
            manager.refresh_metadata();
        }
        Ok(manager)
    }

    pub fn with_embedder(mut self, embedder: Box<dyn Embedder + Send + Sync>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_embeddings(mut self, embeddings: HashMap<String, Vec<f32>>) -> Self {
        self.embeddings = embeddings;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn exec_enabled(&self) -> bool {
        self.exec_enabled
    }

    /// Rescans `skills/` and `agents/**/skills/` for `SKILL.md` documents,
    /// keeping only entries that are also present and enabled in
    /// `skills/registry.json`.
    pub fn refresh_metadata(&mut self) {
        let registry = self.load_registry();
        let mut discovered = HashMap::new();
        for skill_path in self.iter_skill_files() {
            let Ok(rel) = skill_path.strip_prefix(&self.root) else {
                continue;
            };
            let rel_path = rel.to_string_lossy().replace('\\', "/");
            let Some(entry) = registry.get(&rel_path) else {
                continue;
            };
            let Ok(raw) = std::fs::read_to_string(&skill_path) else {
                continue;
            };
            let (frontmatter, _) = split_frontmatter(&raw);
            let Ok(parsed) = serde_yaml::from_str::<HashMap<String, Value>>(&frontmatter) else {
                continue;
            };
            let name = parsed.get("name").and_then(Value::as_str).unwrap_or("").trim().to_string();
            let description = parsed
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            if name.is_empty() || description.is_empty() {
                continue;
            }
            let digest = format!("{:x}", Sha256::digest(frontmatter.as_bytes()));
            discovered.insert(
                rel_path.clone(),
                SkillMetadata {
                    name,
                    description,
                    path: skill_path,
                    rel_path,
                    frontmatter_hash: digest,
                    enabled: entry.enabled,
                    allow_exec: entry.allow_exec,
                    tags: entry.tags.clone(),
                },
            );
        }
        self.metadata_by_path = discovered;
        self.build_bm25_index();
    }

    pub fn list_enabled(&self) -> Vec<&SkillMetadata> {
        if !self.enabled {
            return Vec::new();
        }
        self.metadata_by_path.values().filter(|m| m.enabled).collect()
    }

    /// Returns up to `top_k` skills whose blended score clears `threshold`,
    /// ranked highest first.
    pub fn match_query(&self, query: &str) -> Vec<SkillMatch> {
        if !self.enabled {
            return Vec::new();
        }
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let candidates = self.list_enabled();
        if candidates.is_empty() {
            return Vec::new();
        }

        let keyword_scores = self.score_keyword(trimmed, &candidates);
        let embedding_scores = self.score_embeddings(trimmed, &candidates);

        let mut results: Vec<SkillMatch> = candidates
            .into_iter()
            .filter_map(|meta| {
                let kw = keyword_scores.get(&meta.rel_path).copied().unwrap_or(0.0);
                let emb = embedding_scores.get(&meta.rel_path).copied();
                let blended = match emb {
                    Some(e) => e * EMBEDDING_WEIGHT + kw * KEYWORD_WEIGHT,
                    None => kw,
                };
                if blended < self.threshold {
                    return None;
                }
                Some(SkillMatch {
                    metadata: meta.clone(),
                    score: blended,
                    threshold: self.threshold,
                    keyword_score: kw,
                    embedding_score: emb,
                })
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(self.top_k);

        let preview: String = trimmed.chars().take(160).collect();
        let selected: Vec<Value> = results
            .iter()
            .enumerate()
            .map(|(idx, m)| {
                json!({
                    "name": m.metadata.name,
                    "path": m.metadata.rel_path,
                    "score": m.score,
                    "keyword_score": m.keyword_score,
                    "embedding_score": m.embedding_score,
                    "rank": idx + 1,
                })
            })
            .collect();
        self.emit_event(
            "skill_selected",
            json!({
                "query_preview": preview,
                "threshold": self.threshold,
                "selected": selected,
                "available": candidates_len(&self.metadata_by_path, self.enabled),
            }),
        );
        results
    }

    /// Loads a matched skill's body (everything after frontmatter), capped
    /// at `max_tokens` whitespace-separated tokens.
    pub fn load_body(&self, metadata: &SkillMetadata, max_tokens: usize) -> std::io::Result<(String, usize, bool)> {
        let raw = std::fs::read_to_string(&metadata.path)?;
        let (_, body) = split_frontmatter(&raw);

        let mut collected = Vec::new();
        let mut tokens = 0usize;
        let mut truncated = false;
        for line in body.lines() {
            let line_tokens: Vec<&str> = line.split_whitespace().collect();
            if line_tokens.is_empty() {
                collected.push(line.to_string());
                continue;
            }
            let projected = tokens + line_tokens.len();
            if projected <= max_tokens {
                collected.push(line.to_string());
                tokens = projected;
            } else {
                let remaining = max_tokens.saturating_sub(tokens);
                if remaining > 0 {
                    collected.push(line_tokens[..remaining].join(" "));
                    tokens += remaining;
                }
                truncated = true;
                break;
            }
        }
        let text = collected.join("\n").trim().to_string();

        self.emit_event(
            "skill_loaded",
            json!({
                "path": metadata.rel_path,
                "tokens": tokens,
                "truncated": truncated,
                "allow_exec": metadata.allow_exec && self.exec_enabled,
            }),
        );
        Ok((text, tokens, truncated))
    }

    /// `match_query` plus `load_body` for each result, ready to splice into
    /// an MCP prompt.
    pub fn prepare_payload(&self, query: &str) -> Vec<Value> {
        self.match_query(query)
            .into_iter()
            .enumerate()
            .filter_map(|(idx, m)| {
                let (body, tokens, truncated) = self.load_body(&m.metadata, 5000).ok()?;
                Some(json!({
                    "name": m.metadata.name,
                    "description": m.metadata.description,
                    "path": m.metadata.rel_path,
                    "rank": idx + 1,
                    "score": m.score,
                    "threshold": m.threshold,
                    "body": body,
                    "tokens": tokens,
                    "truncated": truncated,
                    "allow_exec": m.metadata.allow_exec && self.exec_enabled,
                }))
            })
            .collect()
    }

    fn iter_skill_files(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let shared_root = self.root.join("skills");
        if shared_root.exists() {
            walk_for_skill_md(&shared_root, &mut found);
        }
        let agents_root = self.root.join("agents");
        if agents_root.exists() {
            walk_for_agent_skills(&agents_root, &mut found);
        }
        found
    }

    fn load_registry(&self) -> HashMap<String, RegistryEntry> {
        let path = self.root.join("skills").join("registry.json");
        let Ok(raw) = std::fs::read_to_string(path) else {
            return HashMap::new();
        };
        let Ok(parsed) = serde_json::from_str::<RegistryFile>(&raw) else {
            return HashMap::new();
        };
        parsed
            .skills
            .into_iter()
            .filter(|e| !e.path.trim().is_empty())
            .map(|e| (e.path.clone(), e))
            .collect()
    }

    fn build_bm25_index(&mut self) {
        let mut index = HashMap::new();
        let mut doc_lengths = Vec::new();
        for (rel_path, meta) in &self.metadata_by_path {
            let tokens = tokenize(&meta.description);
            doc_lengths.push(tokens.len());
            let mut counts: HashMap<String, f64> = HashMap::new();
            for token in tokens {
                *counts.entry(token).or_insert(0.0) += 1.0;
            }
            index.insert(rel_path.clone(), counts);
        }
        self.bm25_index = index;
        self.avg_doc_len = if doc_lengths.is_empty() {
            0.0
        } else {
            doc_lengths.iter().sum::<usize>() as f64 / doc_lengths.len() as f64
        };
    }

    fn score_keyword(&self, query: &str, candidates: &[&SkillMetadata]) -> HashMap<String, f64> {
        let query_tokens = tokenize(query);
        if self.bm25_index.is_empty() || query_tokens.is_empty() {
            return HashMap::new();
        }
        let doc_count = self.bm25_index.len() as f64;
        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for counts in self.bm25_index.values() {
            for token in counts.keys() {
                *doc_freq.entry(token.as_str()).or_insert(0) += 1;
            }
        }

        let mut scores = HashMap::new();
        for meta in candidates {
            let tf = self.bm25_index.get(&meta.rel_path).cloned().unwrap_or_default();
            let doc_len: f64 = tf.values().sum();
            let mut score = 0.0;
            for token in &query_tokens {
                let df = *doc_freq.get(token.as_str()).unwrap_or(&0) as f64;
                if df == 0.0 {
                    continue;
                }
                let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();
                let term_freq = *tf.get(token).unwrap_or(&0.0);
                let denom = term_freq + BM25_K1 * (1.0 - BM25_B + BM25_B * (doc_len / (self.avg_doc_len.max(1.0))));
                if denom > 0.0 {
                    score += idf * ((term_freq * (BM25_K1 + 1.0)) / denom);
                }
            }
            scores.insert(meta.rel_path.clone(), score);
        }
        let max_score = scores.values().cloned().fold(0.0_f64, f64::max);
        if max_score > 0.0 {
            for value in scores.values_mut() {
                *value = (*value / max_score).min(1.0);
            }
        }
        scores
    }

    fn score_embeddings(&self, query: &str, candidates: &[&SkillMetadata]) -> HashMap<String, f64> {
        let Some(embedder) = &self.embedder else {
            return HashMap::new();
        };
        let Some(query_vector) = embedder.embed(query) else {
            self.emit_event("skill_embedding_fallback", json!({"reason": "embedder_error"}));
            return HashMap::new();
        };
        if query_vector.is_empty() {
            return HashMap::new();
        }
        let mut scores = HashMap::new();
        for meta in candidates {
            let Some(vector) = self.embeddings.get(&meta.rel_path) else {
                continue;
            };
            let similarity = cosine_similarity(&query_vector, vector);
            let normalized = ((similarity + 1.0) / 2.0).clamp(0.0, 1.0) as f64;
            scores.insert(meta.rel_path.clone(), normalized);
        }
        scores
    }

    fn emit_event(&self, event: &str, data: Value) {
        let masked = mask_sensitive(&data);
        let body = json!({
            "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "event": event,
            "data": masked,
        });
        self.telemetry.write_line(body.to_string());
    }
}

fn candidates_len(metadata: &HashMap<String, SkillMetadata>, enabled: bool) -> usize {
    if !enabled {
        return 0;
    }
    metadata.values().filter(|m| m.enabled).count()
}

fn walk_for_skill_md(dir: &Path, found: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if should_skip(&path) {
            continue;
        }
        if path.is_dir() {
            walk_for_skill_md(&path, found);
        } else if path.file_name().and_then(|n| n.to_str()) == Some("SKILL.md") {
            found.push(path);
        }
    }
}

fn walk_for_agent_skills(dir: &Path, found: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if should_skip(&path) {
            continue;
        }
        if path.is_dir() {
            if path.file_name().and_then(|n| n.to_str()) == Some("skills") {
                walk_for_skill_md(&path, found);
            } else {
                walk_for_agent_skills(&path, found);
            }
        }
    }
}

fn should_skip(path: &Path) -> bool {
    path.components().any(|c| {
        let s = c.as_os_str().to_string_lossy();
        s.starts_with('_') || (s.starts_with('.') && s != "." && s != "..")
    })
}

fn split_frontmatter(raw: &str) -> (String, String) {
    if !raw.starts_with("---") {
        return (String::new(), raw.to_string());
    }
    let parts: Vec<&str> = raw.splitn(3, "---").collect();
    if parts.len() < 3 {
        return (parts.get(1).unwrap_or(&"").to_string(), String::new());
    }
    (parts[1].trim_matches('\n').to_string(), parts[2].to_string())
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for ch in text.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            word.push(ch);
        } else if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

fn cosine_similarity(lhs: &[f32], rhs: &[f32]) -> f32 {
    let len = lhs.len().min(rhs.len());
    if len == 0 {
        return 0.0;
    }
    let dot: f32 = (0..len).map(|i| lhs[i] * rhs[i]).sum();
    let norm_l: f32 = lhs[..len].iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_r: f32 = rhs[..len].iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_l == 0.0 || norm_r == 0.0 {
        return 0.0;
    }
    dot / (norm_l * norm_r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_skill(dir: &Path, rel: &str, name: &str, description: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            "---\nname: {name}\ndescription: {description}\n---\nBody text for {name}.\n"
        )
        .unwrap();
    }

    fn write_registry(dir: &Path, entries: &[(&str, bool, bool)]) {
        let skills_list: Vec<Value> = entries
            .iter()
            .map(|(path, enabled, allow_exec)| {
                json!({"path": path, "enabled": enabled, "allow_exec": allow_exec, "tags": []})
            })
            .collect();
        let payload = json!({"skills": skills_list});
        std::fs::write(
            dir.join("skills").join("registry.json"),
            serde_json::to_string(&payload).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn matches_skill_whose_description_contains_query_terms() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(
            dir.path(),
            "skills/deploy/SKILL.md",
            "deploy",
            "deploy the service to production kubernetes",
        );
        write_registry(dir.path(), &[("skills/deploy/SKILL.md", true, false)]);

        let manager = SkillManager::new(
            dir.path(),
            true,
            false,
            dir.path().join("telemetry/skills/events.jsonl"),
            50,
        )
        .unwrap();

        let matches = manager.match_query("deploy service to kubernetes production");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].metadata.name, "deploy");
    }

    #[test]
    fn disabled_manager_never_matches() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "skills/deploy/SKILL.md", "deploy", "deploy the service");
        write_registry(dir.path(), &[("skills/deploy/SKILL.md", true, false)]);

        let manager = SkillManager::new(
            dir.path(),
            false,
            false,
            dir.path().join("telemetry/skills/events.jsonl"),
            50,
        )
        .unwrap();
        assert!(manager.match_query("deploy the service").is_empty());
    }

    #[test]
    fn registry_disabled_entries_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "skills/deploy/SKILL.md", "deploy", "deploy the service");
        write_registry(dir.path(), &[("skills/deploy/SKILL.md", false, false)]);

        let mut manager = SkillManager::new(
            dir.path(),
            true,
            false,
            dir.path().join("telemetry/skills/events.jsonl"),
            50,
        )
        .unwrap();
        manager.refresh_metadata();
        assert!(manager.list_enabled().is_empty());
    }
}
