//! Process spawning.
//!
//! Builds the command line for a service, loads its synthesized `.env`
//! into the child environment, detaches the child into its own process
//! group, and redirects stdout/stderr to the service's append-mode log
//! files.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use super::{ProcessError, SpawnMode};
use crate::registry::{RunEntrypoint, ServiceEntry};

/// A spawned process with its child handle and PID.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle. Kept so the readiness window can detect
    /// an early exit and recover the exit code.
    pub child: Child,
    /// The OS process ID.
    pub pid: u32,
}

/// Spawn a service process.
///
/// The child runs in the service's directory, in its own process group
/// (so orchestrator signals do not reach it), with stdin closed and both
/// output streams appended to the given log files. `extra_env` wins over
/// entries loaded from the service's `.env` file.
///
/// # Errors
///
/// Returns [`ProcessError::SpawnFailed`] when the command line cannot be
/// resolved or the OS refuses the spawn.
pub fn spawn(
    entry: &ServiceEntry,
    mode: SpawnMode,
    extra_env: &HashMap<String, String>,
    stdout_path: &Path,
    stderr_path: &Path,
) -> Result<SpawnedProcess, ProcessError> {
    let (program, args) = resolve_command(entry, mode)?;

    if let Some(parent) = stdout_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(stdout_path)?;
    let stderr = OpenOptions::new()
        .create(true)
        .append(true)
        .open(stderr_path)?;

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(&entry.directory_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .kill_on_drop(false);

    for (key, value) in load_env_file(&entry.directory_path.join(".env")) {
        cmd.env(key, value);
    }
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    cmd.env("ENVIRONMENT", mode.to_string());

    let child = cmd
        .spawn()
        .map_err(|e| ProcessError::SpawnFailed(format!("{}: {e}", program.display())))?;

    let pid = child
        .id()
        .ok_or_else(|| ProcessError::SpawnFailed("failed to get process ID".to_string()))?;

    Ok(SpawnedProcess { child, pid })
}

/// Resolve the program and arguments for a service in the given mode.
///
/// Paths in the entrypoint are relative to the service directory; the
/// program must exist there before we attempt the spawn so the error
/// message names the missing file instead of a bare ENOENT.
fn resolve_command(
    entry: &ServiceEntry,
    mode: SpawnMode,
) -> Result<(std::path::PathBuf, Vec<String>), ProcessError> {
    let dir = &entry.directory_path;

    let command_line = match (&entry.run_entrypoint, mode) {
        (
            RunEntrypoint::Python {
                production_command: Some(command),
                ..
            },
            SpawnMode::Production,
        ) => command.clone(),
        (RunEntrypoint::Python {
            interpreter,
            script,
            ..
        }, _) => {
            let interpreter_abs = dir.join(interpreter);
            if !interpreter_abs.is_file() {
                return Err(ProcessError::SpawnFailed(format!(
                    "interpreter not found: {}",
                    interpreter_abs.display()
                )));
            }
            let script_abs = dir.join(script);
            if !script_abs.is_file() {
                return Err(ProcessError::SpawnFailed(format!(
                    "entry script not found: {}",
                    script_abs.display()
                )));
            }
            return Ok((interpreter_abs, vec![script_abs.display().to_string()]));
        }
        (RunEntrypoint::Command { command }, _) => command.clone(),
    };

    let mut parts = command_line.split_whitespace();
    let Some(program) = parts.next() else {
        return Err(ProcessError::SpawnFailed("empty command line".to_string()));
    };
    let program_abs = dir.join(program);
    if !program_abs.is_file() {
        return Err(ProcessError::SpawnFailed(format!(
            "executable not found: {}",
            program_abs.display()
        )));
    }
    Ok((program_abs, parts.map(str::to_string).collect()))
}

/// Parse a `.env` file into key/value pairs.
///
/// Comments and blank lines are skipped; surrounding single or double
/// quotes on the value are stripped. Empty values are allowed; there is
/// no line continuation.
fn load_env_file(path: &Path) -> Vec<(String, String)> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };

    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use super::*;
    use crate::registry::{ProcessKind, ServiceSource};

    fn shell_entry(dir: &Path, command: &str) -> ServiceEntry {
        ServiceEntry {
            name: "shelltest".to_string(),
            display_name: "Shelltest".to_string(),
            description: String::new(),
            source: ServiceSource::Discovered,
            port: 5999,
            dependencies: BTreeSet::new(),
            install_order: 99,
            git_url: None,
            directory_path: dir.to_path_buf(),
            process_kind: ProcessKind::ManagedPython,
            run_entrypoint: RunEntrypoint::Command {
                command: command.to_string(),
            },
            visible: false,
            admin_only: false,
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_spawn_captures_output_and_env() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "run.sh", "echo \"value=$PROBE_VAR\"");
        std::fs::write(dir.path().join(".env"), "PROBE_VAR=from_env_file\n").unwrap();

        let entry = shell_entry(dir.path(), "run.sh");
        let stdout = dir.path().join("out.log");
        let stderr = dir.path().join("err.log");

        let mut spawned = spawn(
            &entry,
            SpawnMode::Development,
            &HashMap::new(),
            &stdout,
            &stderr,
        )
        .unwrap();
        assert!(spawned.pid > 0);

        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
        let captured = std::fs::read_to_string(&stdout).unwrap();
        assert!(captured.contains("value=from_env_file"));
    }

    #[tokio::test]
    async fn test_extra_env_overrides_env_file() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "run.sh", "echo \"value=$PROBE_VAR\"");
        std::fs::write(dir.path().join(".env"), "PROBE_VAR=file\n").unwrap();

        let entry = shell_entry(dir.path(), "run.sh");
        let mut extra = HashMap::new();
        extra.insert("PROBE_VAR".to_string(), "override".to_string());
        let stdout = dir.path().join("out.log");

        let mut spawned = spawn(
            &entry,
            SpawnMode::Development,
            &extra,
            &stdout,
            &dir.path().join("err.log"),
        )
        .unwrap();
        spawned.child.wait().await.unwrap();

        let captured = std::fs::read_to_string(&stdout).unwrap();
        assert!(captured.contains("value=override"));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let entry = shell_entry(dir.path(), "does_not_exist.sh");

        let err = spawn(
            &entry,
            SpawnMode::Development,
            &HashMap::new(),
            &dir.path().join("out.log"),
            &dir.path().join("err.log"),
        )
        .unwrap_err();

        match err {
            ProcessError::SpawnFailed(msg) => assert!(msg.contains("does_not_exist.sh")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_production_mode_prefers_wsgi_command() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "serve.sh", "true");
        std::fs::create_dir_all(dir.path().join("pyenv/bin")).unwrap();
        write_script(dir.path(), "pyenv/bin/python", "true");
        std::fs::write(dir.path().join("run.py"), "").unwrap();

        let mut entry = shell_entry(dir.path(), "unused");
        entry.run_entrypoint = RunEntrypoint::Python {
            interpreter: PathBuf::from("pyenv/bin/python"),
            script: PathBuf::from("run.py"),
            production_command: Some("serve.sh --workers 4".to_string()),
        };

        let (program, args) = resolve_command(&entry, SpawnMode::Production).unwrap();
        assert!(program.ends_with("serve.sh"));
        assert_eq!(args, vec!["--workers", "4"]);

        let (program, args) = resolve_command(&entry, SpawnMode::Development).unwrap();
        assert!(program.ends_with("pyenv/bin/python"));
        assert_eq!(args.len(), 1);
        assert!(args[0].ends_with("run.py"));
    }

    #[test]
    fn test_load_env_file_strips_quotes_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "# comment\nPLAIN=value\nQUOTED=\"has spaces\"\nSINGLE='x'\nEMPTY=\n",
        )
        .unwrap();

        let vars: HashMap<String, String> = load_env_file(&path).into_iter().collect();
        assert_eq!(vars["PLAIN"], "value");
        assert_eq!(vars["QUOTED"], "has spaces");
        assert_eq!(vars["SINGLE"], "x");
        assert_eq!(vars["EMPTY"], "");
        assert_eq!(vars.len(), 4);
    }
}
