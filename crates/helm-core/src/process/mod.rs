//! Process management module.
//!
//! Types and helpers for tracking, spawning, and signalling the managed
//! processes: the per-service state machine, the mutable process record,
//! pidfile handling, and the spawner.

pub mod pidfile;
pub mod spawner;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Not running as far as the orchestrator knows.
    Stopped,
    /// Spawned, waiting for the readiness window.
    Starting,
    /// Alive and adopted into the supervisor's model.
    Running,
    /// TERM sent, waiting for exit.
    Stopping,
    /// Spawn failed, start timed out, or the process died unexpectedly.
    Error,
}

impl ProcessState {
    /// Whether the process is considered live.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Whether the state is terminal for shutdown-band accounting.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether `start` is permitted from this state.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// How a managed service is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// Run the entry script directly.
    #[default]
    Development,
    /// Run the preconfigured WSGI command.
    Production,
}

impl SpawnMode {
    /// Default mode for this host, from the `DEV_MODE` environment
    /// variable (absent or falsy means production).
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("DEV_MODE") {
            Ok(v) if matches!(v.to_lowercase().as_str(), "1" | "true" | "yes") => {
                Self::Development
            }
            _ => Self::Production,
        }
    }
}

impl std::fmt::Display for SpawnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for SpawnMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "invalid mode '{other}': must be development or production"
            )),
        }
    }
}

/// Mutable per-service process record.
///
/// Created lazily on first reference and never destroyed; across
/// orchestrator restarts it is reconstructed from the pidfile by the
/// adoption pass. Mutated only under the owning service's lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Service this record belongs to.
    pub service_name: String,

    /// Current state.
    pub status: ProcessState,

    /// OS process ID when live.
    pub pid: Option<u32>,

    /// When the process was last started.
    pub started_at: Option<DateTime<Utc>>,

    /// Set while a stop is in flight so crash detection does not report
    /// an orchestrator-initiated exit as a crash.
    pub stop_requested: bool,

    /// Mode the process was last spawned in.
    pub mode: SpawnMode,

    /// Captured-stdout file.
    pub stdout_log_path: PathBuf,

    /// Captured-stderr file.
    pub stderr_log_path: PathBuf,

    /// Exit code of the last terminated run, when known.
    pub last_exit_code: Option<i32>,

    /// Machine-readable kind of the last failure.
    pub last_error_message: Option<String>,
}

impl ProcessRecord {
    /// Fresh stopped record for a service.
    #[must_use]
    pub fn new(service_name: impl Into<String>, stdout: PathBuf, stderr: PathBuf) -> Self {
        Self {
            service_name: service_name.into(),
            status: ProcessState::Stopped,
            pid: None,
            started_at: None,
            stop_requested: false,
            mode: SpawnMode::default(),
            stdout_log_path: stdout,
            stderr_log_path: stderr,
            last_exit_code: None,
            last_error_message: None,
        }
    }

    /// Mark the record failed with a machine-readable kind.
    pub fn fail(&mut self, kind: &str) {
        self.status = ProcessState::Error;
        self.pid = None;
        self.last_error_message = Some(kind.to_string());
    }
}

/// Error types for process operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The service's port is bound by a foreign process.
    #[error("port {port} is in use by a foreign process")]
    PortInUse {
        /// The contested port.
        port: u16,
    },

    /// The service is already running.
    #[error("service already running (pid {pid})")]
    AlreadyRunning {
        /// PID of the live process.
        pid: u32,
    },

    /// The process could not be spawned.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// The process did not become ready inside the start deadline.
    #[error("start timed out")]
    StartTimeout,

    /// The process died inside the readiness window.
    #[error("process exited during startup (exit code {exit_code:?})")]
    DiedDuringStartup {
        /// Exit code when the process was waitable.
        exit_code: Option<i32>,
    },

    /// No such service in the catalog.
    #[error("service not found: {0}")]
    NotFound(String),

    /// Operation not valid in the current state.
    #[error("invalid state for operation: {0}")]
    InvalidState(String),

    /// TERM was delivered but KILL failed; the system state is unknown.
    #[error("failed to kill pid {pid}: {reason}")]
    KillFailed {
        /// PID the signal was aimed at.
        pid: u32,
        /// Underlying failure.
        reason: String,
    },

    /// Configuration synthesis failed before spawn.
    #[error(transparent)]
    Synth(#[from] crate::synth::SynthError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Machine-readable error kind for API bodies and process records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PortInUse { .. } => "port_in_use",
            Self::AlreadyRunning { .. } => "already_running",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::StartTimeout => "start_timeout",
            Self::DiedDuringStartup { .. } => "died_during_startup",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::KillFailed { .. } => "kill_failed",
            Self::Synth(_) => "synthesis_failed",
            Self::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ProcessState::Running.is_running());
        assert!(ProcessState::Stopping.is_running());
        assert!(!ProcessState::Stopped.is_running());

        assert!(ProcessState::Stopped.is_terminal());
        assert!(ProcessState::Error.is_terminal());
        assert!(!ProcessState::Starting.is_terminal());

        assert!(ProcessState::Stopped.can_start());
        assert!(ProcessState::Error.can_start());
        assert!(!ProcessState::Running.can_start());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Error.to_string(), "error");
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "development".parse::<SpawnMode>().unwrap(),
            SpawnMode::Development
        );
        assert_eq!(
            "production".parse::<SpawnMode>().unwrap(),
            SpawnMode::Production
        );
        assert!("prod".parse::<SpawnMode>().is_err());
    }

    #[test]
    fn test_record_fail_sets_kind() {
        let mut record = ProcessRecord::new(
            "beta",
            PathBuf::from("/tmp/beta.stdout.log"),
            PathBuf::from("/tmp/beta.stderr.log"),
        );
        record.status = ProcessState::Starting;
        record.pid = Some(42);

        record.fail("port_in_use");

        assert_eq!(record.status, ProcessState::Error);
        assert_eq!(record.pid, None);
        assert_eq!(record.last_error_message.as_deref(), Some("port_in_use"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ProcessError::PortInUse { port: 5010 }.kind(), "port_in_use");
        assert_eq!(ProcessError::StartTimeout.kind(), "start_timeout");
    }
}
