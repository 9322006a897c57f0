//! Pidfile handling and PID liveness checks.
//!
//! Each managed service has `pids/<name>.pid` holding the decimal PID and
//! a trailing newline. Absence means "not running as far as we know".
//! Pidfiles survive orchestrator restarts and drive the adoption pass.

use std::fs;
use std::io::Write;
use std::path::Path;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::registry::{RunEntrypoint, ServiceEntry};

/// Atomically write a pidfile (temp + rename in the same directory).
///
/// # Errors
///
/// Propagates I/O failures.
pub fn write(path: &Path, pid: u32) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("pidfile path has no parent"))?;
    fs::create_dir_all(parent)?;

    let tmp = path.with_extension("pid.tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        writeln!(f, "{pid}")?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Read a pidfile. Absent or unparsable files yield `None`.
#[must_use]
pub fn read(path: &Path) -> Option<u32> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

/// Remove a pidfile if present.
///
/// # Errors
///
/// Propagates I/O failures other than the file already being gone.
pub fn remove(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether a PID refers to a live process (signal 0 probe).
#[must_use]
pub fn alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), None).is_ok()
}

/// Whether a live PID is plausibly running the given service.
///
/// Managed services run an interpreter, so the executable itself is not
/// distinctive; the check matches the service's entry script (or command)
/// against `/proc/<pid>/cmdline`. A PID whose cmdline cannot be read is
/// treated as not matching (fail closed: adoption then clears the
/// pidfile rather than adopting a stranger).
#[must_use]
pub fn matches_service(pid: u32, entry: &ServiceEntry) -> bool {
    let Ok(raw) = fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let cmdline: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();

    let needle = match &entry.run_entrypoint {
        RunEntrypoint::Python { script, .. } => script.display().to_string(),
        RunEntrypoint::Command { command } => command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    if needle.is_empty() {
        return false;
    }

    let dir = entry.directory_path.display().to_string();
    cmdline
        .iter()
        .any(|arg| arg.ends_with(&needle) || arg.contains(&dir))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use super::*;
    use crate::registry::{ProcessKind, ServiceSource};

    #[test]
    fn test_write_read_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pids").join("beta.pid");

        write(&path, 4242).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242\n");
        assert_eq!(read(&path), Some(4242));

        remove(&path).unwrap();
        assert_eq!(read(&path), None);
        // Removing an absent pidfile is a no-op.
        remove(&path).unwrap();
    }

    #[test]
    fn test_read_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pid");
        fs::write(&path, "not-a-pid\n").unwrap();
        assert_eq!(read(&path), None);
    }

    #[test]
    fn test_alive_for_self_and_bogus_pid() {
        assert!(alive(std::process::id()));
        assert!(!alive(999_999_999));
    }

    #[test]
    fn test_matches_service_against_own_cmdline() {
        // The test binary's argv[0] ends with the crate's test executable
        // name; a service whose "command" is that path should match.
        let exe = std::env::current_exe().unwrap();
        let entry = ServiceEntry {
            name: "selftest".to_string(),
            display_name: "Selftest".to_string(),
            description: String::new(),
            source: ServiceSource::Discovered,
            port: 5555,
            dependencies: BTreeSet::new(),
            install_order: 99,
            git_url: None,
            directory_path: exe.parent().unwrap().to_path_buf(),
            process_kind: ProcessKind::ManagedPython,
            run_entrypoint: RunEntrypoint::Command {
                command: exe.file_name().unwrap().to_string_lossy().into_owned(),
            },
            visible: false,
            admin_only: false,
        };

        assert!(matches_service(std::process::id(), &entry));

        let other = ServiceEntry {
            run_entrypoint: RunEntrypoint::Command {
                command: "definitely_not_this_binary".to_string(),
            },
            directory_path: PathBuf::from("/nonexistent"),
            ..entry
        };
        assert!(!matches_service(std::process::id(), &other));
    }
}
