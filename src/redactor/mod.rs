//! Recursive masking of sensitive fields before any telemetry line is
//! serialized.
//!
//! This is the single place where the sensitive-keyword list lives; every
//! JSONL writer (run events, MCP audit records, skill telemetry) must route
//! its payload through [`mask_sensitive`] immediately before
//! `serde_json::to_string`.

use serde_json::Value;

const SENSITIVE_KEYWORDS: &[&str] = &[
    "api_key",
    "apikey",
    "authorization",
    "secret",
    "password",
    "bearer",
];

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Recursively replaces any object value whose key matches a sensitive
/// keyword (case-insensitive substring match) with the literal `"***"`.
/// Arrays and nested objects are walked; all other values pass through
/// unchanged.
pub fn mask_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut masked = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_sensitive_key(k) {
                    masked.insert(k.clone(), Value::String("***".to_string()));
                } else {
                    masked.insert(k.clone(), mask_sensitive(v));
                }
            }
            Value::Object(masked)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_sensitive).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_top_level_sensitive_key() {
        let input = json!({"api_key": "sk-123", "model": "gpt-4"});
        let out = mask_sensitive(&input);
        assert_eq!(out["api_key"], json!("***"));
        assert_eq!(out["model"], json!("gpt-4"));
    }

    #[test]
    fn masks_nested_and_case_insensitive() {
        let input = json!({
            "config": {"Authorization": "Bearer xyz", "timeout_sec": 30},
            "items": [{"password": "hunter2"}, {"ok": true}],
        });
        let out = mask_sensitive(&input);
        assert_eq!(out["config"]["Authorization"], json!("***"));
        assert_eq!(out["config"]["timeout_sec"], json!(30));
        assert_eq!(out["items"][0]["password"], json!("***"));
        assert_eq!(out["items"][1]["ok"], json!(true));
    }

    #[test]
    fn idempotent_under_repeated_application() {
        let input = json!({"secret": "s3cr3t", "nested": {"bearer_token": "abc"}});
        let once = mask_sensitive(&input);
        let twice = mask_sensitive(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn key_substring_match_catches_variants() {
        let input = json!({"openai_apikey": "x", "my_secret_value": "y"});
        let out = mask_sensitive(&input);
        assert_eq!(out["openai_apikey"], json!("***"));
        assert_eq!(out["my_secret_value"], json!("***"));
    }
}
