//! Reads a flow document from disk. Dispatches on file extension (`.yaml`/
//! `.yml` vs `.json`), optionally validates it against the JSON Schema
//! referenced by its own `$schema` key, and deserializes it into a
//! [`FlowDefinition`]. Structural checks (duplicate ids, cycles, ...) are a
//! separate, unconditional step in [`crate::validation`].

use std::path::Path;

use crate::errors::FlowError;
use crate::model::FlowDefinition;

/// Loads and parses a flow document. `skip_schema_validation` mirrors
/// `--dev-fast`: when true, a `$schema` reference on the document is never
/// resolved or checked.
pub fn load_flow_from_file(path: impl AsRef<Path>, skip_schema_validation: bool) -> Result<FlowDefinition, FlowError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| FlowError::LoadError {
        path: path.display().to_string(),
        reason: format!("could not read file: {e}"),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let raw: serde_json::Value = if is_yaml {
        serde_yaml::from_str(&contents).map_err(|e| FlowError::LoadError {
            path: path.display().to_string(),
            reason: format!("invalid YAML: {e}"),
        })?
    } else {
        serde_json::from_str(&contents).map_err(|e| FlowError::LoadError {
            path: path.display().to_string(),
            reason: format!("invalid JSON: {e}"),
        })?
    };

    if !skip_schema_validation {
        validate_against_schema(&raw, path)?;
    }

    let flow: FlowDefinition = serde_json::from_value(raw).map_err(|e| FlowError::LoadError {
        path: path.display().to_string(),
        reason: format!("flow document does not match the expected shape: {e}"),
    })?;

    if flow.version != 1 {
        return Err(FlowError::LoadError {
            path: path.display().to_string(),
            reason: format!("unsupported flow version {}", flow.version),
        });
    }

    Ok(flow)
}

/// If `raw` carries a `$schema` key, resolves it relative to the flow file's
/// directory (absolute references pass through unchanged), compiles it as a
/// Draft 2020-12 schema, and validates `raw` against it. A flow with no
/// `$schema` key skips validation entirely — there is nothing to check it
/// against.
fn validate_against_schema(raw: &serde_json::Value, flow_path: &Path) -> Result<(), FlowError> {
    let Some(schema_ref) = raw.get("$schema").and_then(|v| v.as_str()) else {
        return Ok(());
    };

    let schema_path = Path::new(schema_ref);
    let schema_path = if schema_path.is_absolute() {
        schema_path.to_path_buf()
    } else {
        flow_path.parent().unwrap_or_else(|| Path::new(".")).join(schema_path)
    };

    let schema_contents = std::fs::read_to_string(&schema_path).map_err(|e| FlowError::LoadError {
        path: flow_path.display().to_string(),
        reason: format!("flow schema '{}' not found: {e}", schema_path.display()),
    })?;
    let schema: serde_json::Value = serde_json::from_str(&schema_contents).map_err(|e| FlowError::LoadError {
        path: flow_path.display().to_string(),
        reason: format!("flow schema '{}' is not valid JSON: {e}", schema_path.display()),
    })?;
    let validator = jsonschema::Validator::new(&schema).map_err(|e| FlowError::LoadError {
        path: flow_path.display().to_string(),
        reason: format!("flow schema '{}' failed to compile: {e}", schema_path.display()),
    })?;

    let errors: Vec<String> = validator.iter_errors(raw).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FlowError::LoadError {
            path: flow_path.display().to_string(),
            reason: format!("flow failed schema validation: {}", errors.join("; ")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_yaml_flow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            "version: 1\nsteps:\n  - id: build\n    uses: shell\n    run: echo hi\n"
        )
        .unwrap();

        let flow = load_flow_from_file(&path, true).unwrap();
        assert_eq!(flow.steps.len(), 1);
        assert_eq!(flow.steps[0].id(), "build");
    }

    #[test]
    fn loads_json_flow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(
            &path,
            r#"{"version":1,"steps":[{"id":"build","uses":"shell","run":"echo hi"}]}"#,
        )
        .unwrap();

        let flow = load_flow_from_file(&path, true).unwrap();
        assert_eq!(flow.steps.len(), 1);
    }

    #[test]
    fn rejects_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(&path, r#"{"version":2,"steps":[]}"#).unwrap();
        assert!(load_flow_from_file(&path, true).is_err());
    }

    #[test]
    fn validates_against_referenced_schema() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("flow.schema.json"),
            r#"{"type":"object","required":["version","steps","extra"]}"#,
        )
        .unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(
            &path,
            r#"{"$schema":"flow.schema.json","version":1,"steps":[{"id":"build","uses":"shell","run":"echo hi"}]}"#,
        )
        .unwrap();

        let err = load_flow_from_file(&path, false).unwrap_err();
        assert!(matches!(err, FlowError::LoadError { .. }));
    }

    #[test]
    fn skip_schema_validation_bypasses_a_failing_schema() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("flow.schema.json"),
            r#"{"type":"object","required":["version","steps","extra"]}"#,
        )
        .unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(
            &path,
            r#"{"$schema":"flow.schema.json","version":1,"steps":[{"id":"build","uses":"shell","run":"echo hi"}]}"#,
        )
        .unwrap();

        assert!(load_flow_from_file(&path, true).is_ok());
    }
}
