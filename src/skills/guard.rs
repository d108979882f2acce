//! Skill Execution Guard: the only path by which a Skill's script may spawn
//! a subprocess. Every precondition is checked in order and any failure
//! short-circuits into a [`FlowError::SkillBlocked`] before the guard ever
//! looks at the filesystem for execute permission.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::errors::{FlowError, SkillBlockReason};
use crate::jsonl::AsyncLineWriter;
use crate::redactor::mask_sensitive;

#[derive(Debug, Clone)]
struct AllowlistEntry {
    sha256: String,
    args_pattern: String,
}

pub struct SkillOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

pub struct SkillExecutionGuard {
    root: PathBuf,
    exec_enabled: bool,
    sandbox_mode: String,
    allowlist: HashMap<String, AllowlistEntry>,
    telemetry: AsyncLineWriter,
}

impl SkillExecutionGuard {
    pub fn new(
        root: impl Into<PathBuf>,
        exec_enabled: bool,
        sandbox_mode: impl Into<String>,
        allowlist_path: impl AsRef<Path>,
        telemetry_path: impl AsRef<Path>,
        flush_every: usize,
    ) -> std::io::Result<Self> {
        let root = root.into();
        let allowlist = load_allowlist(allowlist_path.as_ref());
        let telemetry = AsyncLineWriter::open(telemetry_path, flush_every)?;
        Ok(Self {
            root,
            exec_enabled,
            sandbox_mode: sandbox_mode.into(),
            allowlist,
            telemetry,
        })
    }

    /// Runs `script_path` with `args` if every guard precondition passes.
    /// `env` is layered over the base `SKILL_SANDBOX`/`PATH`/`HOME`
    /// environment.
    pub fn execute(
        &self,
        skill_name: &str,
        script_path: impl AsRef<Path>,
        args: &[String],
        allow_exec: bool,
        workspace_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<SkillOutcome, FlowError> {
        let workspace = workspace_dir.unwrap_or(&self.root);

        let resolved = self.resolve_script(script_path.as_ref())?;
        let script_rel = resolved
            .strip_prefix(&self.root)
            .unwrap_or(&resolved)
            .to_string_lossy()
            .replace('\\', "/");

        self.emit_event(
            "skill_exec_attempt",
            json!({
                "path": script_rel,
                "skill": skill_name,
                "allow_exec": allow_exec,
                "sandbox": self.sandbox_mode,
                "args": args,
            }),
        );

        if !self.exec_enabled {
            return self.block(&script_rel, SkillBlockReason::SkillsExecDisabled, skill_name);
        }
        if !allow_exec {
            return self.block(&script_rel, SkillBlockReason::SkillNotAllowExec, skill_name);
        }

        let Some(entry) = self.allowlist.get(&script_rel) else {
            return self.block(&script_rel, SkillBlockReason::MissingAllowlistEntry, skill_name);
        };

        let actual_hash = match hash_file(&resolved) {
            Ok(hash) => hash,
            Err(_) => return self.block(&script_rel, SkillBlockReason::ScriptNotFound, skill_name),
        };
        if actual_hash != entry.sha256 {
            return self.block(&script_rel, SkillBlockReason::HashMismatch, skill_name);
        }

        if !entry.args_pattern.is_empty() {
            let joined = args.join(" ");
            let matches = Regex::new(&format!("^(?:{})$", entry.args_pattern))
                .map(|re| re.is_match(&joined))
                .unwrap_or(false);
            if !matches {
                return self.block(&script_rel, SkillBlockReason::ArgsNotAllowed, skill_name);
            }
        }

        let mut command = std::process::Command::new(&resolved);
        command
            .args(args)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .env("SKILL_SANDBOX", &self.sandbox_mode)
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", std::env::var("HOME").unwrap_or_default());
        for (k, v) in env {
            command.env(k, v);
        }

        let output = match command.output() {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.block(&script_rel, SkillBlockReason::ScriptNotFound, skill_name)
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return self.block(&script_rel, SkillBlockReason::PermissionDenied, skill_name)
            }
            Err(e) => {
                return Err(FlowError::StepFailure {
                    step_id: skill_name.to_string(),
                    reason: format!("failed to spawn skill script: {e}"),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            self.emit_result(&script_rel, "failed", &stdout, &stderr, Some(exit_code), Some(&actual_hash), Some("non_zero_exit"), skill_name);
            return Err(FlowError::SkillBlocked {
                reason: SkillBlockReason::NonZeroExit,
                detail: format!("skill script exited with code {exit_code}"),
            });
        }

        self.emit_result(&script_rel, "succeeded", &stdout, &stderr, Some(0), Some(&actual_hash), None, skill_name);
        Ok(SkillOutcome {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn resolve_script(&self, path: &Path) -> Result<PathBuf, FlowError> {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let normalized = normalize(&candidate);
        let normalized_root = normalize(&self.root);
        if !normalized.starts_with(&normalized_root) {
            return Err(FlowError::SkillBlocked {
                reason: SkillBlockReason::OutsideWorkspace,
                detail: "skill script must reside within the workspace root".to_string(),
            });
        }
        Ok(normalized)
    }

    fn block(&self, script_rel: &str, reason: SkillBlockReason, skill_name: &str) -> Result<SkillOutcome, FlowError> {
        self.emit_result(script_rel, "blocked", "", "", None, None, Some(reason.as_str()), skill_name);
        Err(FlowError::SkillBlocked {
            reason,
            detail: format!("skill '{skill_name}' script '{script_rel}' blocked: {}", reason.as_str()),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_result(
        &self,
        path: &str,
        status: &str,
        stdout: &str,
        stderr: &str,
        exit_code: Option<i32>,
        sha: Option<&str>,
        reason: Option<&str>,
        skill_name: &str,
    ) {
        let preview = |s: &str| s.chars().take(160).collect::<String>();
        self.emit_event(
            "skill_exec_result",
            json!({
                "path": path,
                "status": status,
                "stdout_preview": preview(stdout),
                "stderr_preview": preview(stderr),
                "exit_code": exit_code,
                "sha256": sha,
                "reason": reason,
                "skill": skill_name,
            }),
        );
    }

    fn emit_event(&self, event: &str, data: serde_json::Value) {
        let masked = mask_sensitive(&data);
        let body = json!({
            "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "event": event,
            "data": masked,
        });
        self.telemetry.write_line(body.to_string());
    }
}

fn load_allowlist(path: &Path) -> HashMap<String, AllowlistEntry> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    let mut entries = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.splitn(3, char::is_whitespace).collect();
        if parts.len() < 3 {
            continue;
        }
        entries.insert(
            parts[0].to_string(),
            AllowlistEntry {
                sha256: parts[1].to_string(),
                args_pattern: parts[2].to_string(),
            },
        );
    }
    entries
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_executable_script(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::File::create(path).unwrap();
        write!(file, "{contents}").unwrap();
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }

    fn setup(root: &Path, script_rel: &str, script_body: &str, args_pattern: &str) -> String {
        let script_path = root.join(script_rel);
        write_executable_script(&script_path, script_body);
        let hash = hash_file(&script_path).unwrap();
        let allowlist_path = root.join("skills/ALLOWLIST.txt");
        std::fs::create_dir_all(allowlist_path.parent().unwrap()).unwrap();
        std::fs::write(&allowlist_path, format!("{script_rel} {hash} {args_pattern}\n")).unwrap();
        hash
    }

    #[test]
    fn runs_allowlisted_script_successfully() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path(), "skills/deploy/run.sh", "#!/bin/sh\necho hello\n", ".*");

        let guard = SkillExecutionGuard::new(
            dir.path(),
            true,
            "read-only",
            dir.path().join("skills/ALLOWLIST.txt"),
            dir.path().join("telemetry/skills/events.jsonl"),
            1,
        )
        .unwrap();

        let outcome = guard
            .execute("deploy", dir.path().join("skills/deploy/run.sh"), &[], true, None, &HashMap::new())
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("hello"));
    }

    #[test]
    fn blocks_when_exec_disabled() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path(), "skills/deploy/run.sh", "#!/bin/sh\necho hi\n", ".*");

        let guard = SkillExecutionGuard::new(
            dir.path(),
            false,
            "read-only",
            dir.path().join("skills/ALLOWLIST.txt"),
            dir.path().join("telemetry/skills/events.jsonl"),
            1,
        )
        .unwrap();

        let err = guard
            .execute("deploy", dir.path().join("skills/deploy/run.sh"), &[], true, None, &HashMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::SkillBlocked {
                reason: SkillBlockReason::SkillsExecDisabled,
                ..
            }
        ));
    }

    #[test]
    fn blocks_on_hash_mismatch_after_script_is_modified() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path(), "skills/deploy/run.sh", "#!/bin/sh\necho hi\n", ".*");
        write_executable_script(&dir.path().join("skills/deploy/run.sh"), "#!/bin/sh\necho tampered\n");

        let guard = SkillExecutionGuard::new(
            dir.path(),
            true,
            "read-only",
            dir.path().join("skills/ALLOWLIST.txt"),
            dir.path().join("telemetry/skills/events.jsonl"),
            1,
        )
        .unwrap();

        let err = guard
            .execute("deploy", dir.path().join("skills/deploy/run.sh"), &[], true, None, &HashMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::SkillBlocked {
                reason: SkillBlockReason::HashMismatch,
                ..
            }
        ));
    }

    #[test]
    fn blocks_when_args_fail_the_allowlisted_pattern() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path(), "skills/deploy/run.sh", "#!/bin/sh\necho hi\n", "--env=(staging|prod)");

        let guard = SkillExecutionGuard::new(
            dir.path(),
            true,
            "read-only",
            dir.path().join("skills/ALLOWLIST.txt"),
            dir.path().join("telemetry/skills/events.jsonl"),
            1,
        )
        .unwrap();

        let err = guard
            .execute(
                "deploy",
                dir.path().join("skills/deploy/run.sh"),
                &["--env=danger".to_string()],
                true,
                None,
                &HashMap::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::SkillBlocked {
                reason: SkillBlockReason::ArgsNotAllowed,
                ..
            }
        ));
    }

    #[test]
    fn blocks_script_outside_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        setup(dir.path(), "skills/deploy/run.sh", "#!/bin/sh\necho hi\n", ".*");

        let guard = SkillExecutionGuard::new(
            dir.path(),
            true,
            "read-only",
            dir.path().join("skills/ALLOWLIST.txt"),
            dir.path().join("telemetry/skills/events.jsonl"),
            1,
        )
        .unwrap();

        let err = guard
            .execute(
                "deploy",
                outside.path().join("run.sh"),
                &[],
                true,
                None,
                &HashMap::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::SkillBlocked {
                reason: SkillBlockReason::OutsideWorkspace,
                ..
            }
        ));
    }
}
