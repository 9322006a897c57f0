//! Process supervision.
//!
//! The supervisor owns one mutable [`ProcessRecord`] per service, guarded
//! by a per-service async mutex so start/stop/restart for a given service
//! are serialized and take effect in arrival order, while operations on
//! different services run concurrently.
//!
//! Records are never destroyed; across orchestrator restarts the adoption
//! pass reconstructs the running set from pidfiles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::MasterConfig;
use crate::health::port_open;
use crate::paths::HelmPaths;
use crate::process::{ProcessError, ProcessRecord, ProcessState, SpawnMode, pidfile, spawner};
use crate::registry::{ProcessKind, ServiceCatalog, projection};
use crate::synth;

/// Supervisor timing knobs.
#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    /// Post-spawn window in which the port is polled and an early death
    /// is detected.
    pub readiness_window: Duration,

    /// Overall deadline for one start operation. A start that exceeds it
    /// leaves the service in `error` and KILLs the tracked child.
    pub start_deadline: Duration,

    /// Grace period between TERM and KILL.
    pub stop_timeout: Duration,

    /// Poll interval for liveness and port checks.
    pub poll_interval: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            readiness_window: Duration::from_secs(3),
            start_deadline: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// A crash observed by the monitor's process probe.
#[derive(Debug, Clone)]
pub struct CrashReport {
    /// PID that disappeared.
    pub pid: u32,
    /// Exit code, when the dead process was still waitable.
    pub exit_code: Option<i32>,
    /// Tail of the service's stderr log.
    pub stderr_tail: String,
}

/// Aggregate failure from a banded bulk operation (startup or shutdown).
#[derive(Debug, thiserror::Error)]
#[error("{operation} completed with {} failure(s)", failures.len())]
pub struct BandErrors {
    /// Which bulk operation this came from.
    pub operation: &'static str,
    /// `(service, error kind)` for each service that failed.
    pub failures: Vec<(String, String)>,
}

struct ServiceSlot {
    record: Mutex<ProcessRecord>,
}

/// Supervisor for every service in the catalog.
pub struct Supervisor {
    paths: HelmPaths,
    catalog: Arc<ServiceCatalog>,
    master: Arc<RwLock<MasterConfig>>,
    timings: SupervisorTimings,
    slots: std::sync::Mutex<HashMap<String, Arc<ServiceSlot>>>,
}

impl Supervisor {
    /// Create a supervisor over the given catalog.
    #[must_use]
    pub fn new(
        paths: HelmPaths,
        catalog: Arc<ServiceCatalog>,
        master: Arc<RwLock<MasterConfig>>,
    ) -> Self {
        Self {
            paths,
            catalog,
            master,
            timings: SupervisorTimings::default(),
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Override the timing knobs (tests shrink the windows).
    #[must_use]
    pub fn with_timings(mut self, timings: SupervisorTimings) -> Self {
        self.timings = timings;
        self
    }

    /// The catalog this supervisor manages.
    #[must_use]
    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    fn slot(&self, name: &str) -> Arc<ServiceSlot> {
        let mut slots = self.slots.lock().expect("slot map lock poisoned");
        slots
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ServiceSlot {
                    record: Mutex::new(ProcessRecord::new(
                        name,
                        self.paths.stdout_log(name),
                        self.paths.stderr_log(name),
                    )),
                })
            })
            .clone()
    }

    /// Start a service.
    ///
    /// Preconditions, adoption of a port already held by our own recorded
    /// PID, fresh config synthesis, detached spawn, pidfile write, and
    /// the readiness window are all described by the returned error kinds.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] with kind `port_in_use`,
    /// `already_running`, `spawn_failed`, `died_during_startup`, or
    /// `start_timeout`.
    pub async fn start(&self, name: &str, mode: SpawnMode) -> Result<ProcessRecord, ProcessError> {
        let entry = self
            .catalog
            .get(name)
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))?
            .clone();
        let slot = self.slot(name);
        let mut record = slot.record.lock().await;

        if record.status.is_running() {
            if let Some(pid) = record.pid {
                if pidfile::alive(pid) {
                    return Err(ProcessError::AlreadyRunning { pid });
                }
            }
            // The record claims running but the process is gone; fall
            // through and start fresh.
            record.status = ProcessState::Stopped;
            record.pid = None;
        }

        // Port check. A port held by the PID in our own pidfile means a
        // prior orchestrator run left the service up: adopt it.
        if port_open(entry.port, Duration::from_millis(500)).await {
            let recorded = pidfile::read(&self.paths.pidfile(name));
            if let Some(pid) = recorded {
                if pidfile::alive(pid) && pidfile::matches_service(pid, &entry) {
                    info!(service = %name, pid, "adopting process already holding its port");
                    record.status = ProcessState::Running;
                    record.pid = Some(pid);
                    record.stop_requested = false;
                    return Ok(record.clone());
                }
            }
            record.fail("port_in_use");
            return Err(ProcessError::PortInUse { port: entry.port });
        }

        // Freshly synthesize the service's config before every start.
        {
            let master = self.master.read().await;
            let thin = projection::load_thin_registry(&self.paths)
                .map_err(|e| ProcessError::SpawnFailed(format!("thin registry: {e}")))?;
            synth::write_service_config(&master, &entry, &thin)?;
        }

        let extra_env = self.spawn_env(&entry).await;
        record.status = ProcessState::Starting;
        record.mode = mode;
        record.stop_requested = false;
        record.last_exit_code = None;
        record.last_error_message = None;

        let stdout_path = record.stdout_log_path.clone();
        let stderr_path = record.stderr_log_path.clone();
        let pidfile_path = self.paths.pidfile(name);
        let timings = self.timings.clone();

        let started = tokio::time::timeout(timings.start_deadline, async {
            let mut spawned =
                spawner::spawn(&entry, mode, &extra_env, &stdout_path, &stderr_path)?;
            pidfile::write(&pidfile_path, spawned.pid)?;

            // Readiness window: wait for the port, or catch an early
            // death with its exit code.
            let deadline = tokio::time::Instant::now() + timings.readiness_window;
            loop {
                if let Some(status) = spawned
                    .child
                    .try_wait()
                    .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?
                {
                    pidfile::remove(&pidfile_path)?;
                    return Err(ProcessError::DiedDuringStartup {
                        exit_code: status.code(),
                    });
                }
                if port_open(entry.port, Duration::from_millis(250)).await {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    // Still alive but not yet listening (slow starters
                    // such as the identity provider). The monitor takes
                    // over from here.
                    break;
                }
                tokio::time::sleep(timings.poll_interval).await;
            }
            Ok::<u32, ProcessError>(spawned.pid)
        })
        .await;

        match started {
            Ok(Ok(pid)) => {
                record.status = ProcessState::Running;
                record.pid = Some(pid);
                record.started_at = Some(Utc::now());
                info!(service = %name, pid, %mode, "service started");
                Ok(record.clone())
            }
            Ok(Err(err)) => {
                if let ProcessError::DiedDuringStartup { exit_code } = &err {
                    record.last_exit_code = *exit_code;
                }
                record.fail(err.kind());
                error!(service = %name, kind = err.kind(), "start failed: {err}");
                Err(err)
            }
            Err(_elapsed) => {
                // Never leave a live unreferenced child behind: the
                // pidfile was written before the wait, so KILL whatever
                // it points at.
                if let Some(pid) = pidfile::read(&pidfile_path) {
                    let _ = signal_pid(pid, Signal::SIGKILL);
                    let _ = pidfile::remove(&pidfile_path);
                }
                record.fail("start_timeout");
                error!(service = %name, "start deadline exceeded");
                Err(ProcessError::StartTimeout)
            }
        }
    }

    /// Stop a service: TERM, bounded wait, then KILL.
    ///
    /// Stopping an already-stopped service is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::KillFailed`] when even KILL could not be
    /// delivered, leaving the system in a known-inconsistent state.
    pub async fn stop(&self, name: &str) -> Result<ProcessRecord, ProcessError> {
        if !self.catalog.contains(name) {
            return Err(ProcessError::NotFound(name.to_string()));
        }
        let slot = self.slot(name);
        let mut record = slot.record.lock().await;
        let pidfile_path = self.paths.pidfile(name);

        let pid = record.pid.or_else(|| pidfile::read(&pidfile_path));
        let Some(pid) = pid.filter(|p| pidfile::alive(*p)) else {
            pidfile::remove(&pidfile_path)?;
            record.status = ProcessState::Stopped;
            record.pid = None;
            record.stop_requested = false;
            return Ok(record.clone());
        };

        record.status = ProcessState::Stopping;
        record.stop_requested = true;
        debug!(service = %name, pid, "sending TERM");
        // An ESRCH here just means the process exited between the
        // liveness check and the signal.
        let _ = signal_pid(pid, Signal::SIGTERM);

        let deadline = tokio::time::Instant::now() + self.timings.stop_timeout;
        while pidfile::alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.timings.poll_interval).await;
        }

        if pidfile::alive(pid) {
            warn!(service = %name, pid, "TERM grace period expired, sending KILL");
            signal_pid(pid, Signal::SIGKILL).map_err(|e| ProcessError::KillFailed {
                pid,
                reason: e.to_string(),
            })?;
            let kill_deadline = tokio::time::Instant::now() + Duration::from_secs(1);
            while pidfile::alive(pid) && tokio::time::Instant::now() < kill_deadline {
                tokio::time::sleep(self.timings.poll_interval).await;
            }
            if pidfile::alive(pid) {
                return Err(ProcessError::KillFailed {
                    pid,
                    reason: "process survived SIGKILL".to_string(),
                });
            }
        }

        pidfile::remove(&pidfile_path)?;
        record.status = ProcessState::Stopped;
        record.pid = None;
        record.stop_requested = false;
        info!(service = %name, "service stopped");
        Ok(record.clone())
    }

    /// Restart a service. A no-op stop (already stopped) proceeds to the
    /// start.
    ///
    /// # Errors
    ///
    /// Propagates the stop or start failure.
    pub async fn restart(
        &self,
        name: &str,
        mode: SpawnMode,
    ) -> Result<ProcessRecord, ProcessError> {
        self.stop(name).await?;
        self.start(name, mode).await
    }

    /// Snapshot of one service's process record.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::NotFound`] for an unknown service.
    pub async fn status(&self, name: &str) -> Result<ProcessRecord, ProcessError> {
        if !self.catalog.contains(name) {
            return Err(ProcessError::NotFound(name.to_string()));
        }
        Ok(self.slot(name).record.lock().await.clone())
    }

    /// Snapshot of every service's process record, keyed by name.
    pub async fn status_all(&self) -> BTreeMap<String, ProcessRecord> {
        let mut out = BTreeMap::new();
        for name in self.catalog.names() {
            out.insert(name.to_string(), self.slot(name).record.lock().await.clone());
        }
        out
    }

    /// Adoption pass over pidfiles on orchestrator startup.
    ///
    /// A pidfile whose PID is alive and whose cmdline matches the service
    /// marks the service `running` without restarting it; anything else
    /// removes the stale pidfile.
    pub async fn adopt_all(&self) {
        for entry in self.catalog.iter() {
            let pidfile_path = self.paths.pidfile(&entry.name);
            let Some(pid) = pidfile::read(&pidfile_path) else {
                continue;
            };

            if pidfile::alive(pid) && pidfile::matches_service(pid, entry) {
                let slot = self.slot(&entry.name);
                let mut record = slot.record.lock().await;
                record.status = ProcessState::Running;
                record.pid = Some(pid);
                record.stop_requested = false;
                info!(service = %entry.name, pid, "adopted running process");
            } else {
                if let Err(e) = pidfile::remove(&pidfile_path) {
                    warn!(service = %entry.name, "failed to remove stale pidfile: {e}");
                }
                debug!(service = %entry.name, pid, "removed stale pidfile");
            }
        }
    }

    /// Crash detection for the monitor's process probe.
    ///
    /// When a service the record believes is live has a dead PID and no
    /// stop in flight, the record flips to `error` and a report with the
    /// stderr tail is returned for the monitor to log.
    pub async fn detect_crash(&self, name: &str) -> Option<CrashReport> {
        let slot = self.slot(name);
        let mut record = slot.record.lock().await;

        if !record.status.is_running() || record.stop_requested {
            return None;
        }
        let pid = record.pid?;
        if pidfile::alive(pid) {
            return None;
        }

        let exit_code = reap_exit_code(pid);
        let stderr_tail = tail_file(&record.stderr_log_path, 500);
        record.fail("crashed");
        record.last_exit_code = exit_code;
        let _ = pidfile::remove(&self.paths.pidfile(name));

        Some(CrashReport {
            pid,
            exit_code,
            stderr_tail,
        })
    }

    /// Start every service in ascending `install_order`, concurrently
    /// within each band, waiting for the whole band before the next one.
    /// An already-running service counts as success.
    ///
    /// # Errors
    ///
    /// Returns the aggregate of per-service failures; every band is still
    /// processed.
    pub async fn startup_all(self: &Arc<Self>, mode: SpawnMode) -> Result<(), BandErrors> {
        let bands = self.catalog.install_bands();
        let mut failures = Vec::new();

        for (order, members) in bands {
            debug!(order, services = members.len(), "starting startup band");
            let mut set = JoinSet::new();
            for name in members {
                let supervisor = Arc::clone(self);
                set.spawn(async move {
                    let result = supervisor.start(&name, mode).await;
                    (name, result)
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(_))) | Ok((_, Err(ProcessError::AlreadyRunning { .. }))) => {}
                    Ok((name, Err(e))) => failures.push((name, e.kind().to_string())),
                    Err(join_err) => {
                        failures.push(("<task>".to_string(), join_err.to_string()));
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BandErrors {
                operation: "startup",
                failures,
            })
        }
    }

    /// Stop every service in reverse `install_order`, concurrently within
    /// each band, waiting for the whole band to reach a terminal state
    /// before the next band is signalled.
    ///
    /// # Errors
    ///
    /// Returns the aggregate of per-service failures; every band is still
    /// processed.
    pub async fn shutdown_all(self: &Arc<Self>) -> Result<(), BandErrors> {
        let mut failures = Vec::new();
        let bands = self.catalog.install_bands();

        for (order, members) in bands.into_iter().rev() {
            debug!(order, services = members.len(), "stopping shutdown band");
            let mut set = JoinSet::new();
            for name in members {
                let supervisor = Arc::clone(self);
                set.spawn(async move {
                    let result = supervisor.stop(&name).await;
                    (name, result)
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(_))) => {}
                    Ok((name, Err(e))) => failures.push((name, e.kind().to_string())),
                    Err(join_err) => {
                        failures.push(("<task>".to_string(), join_err.to_string()));
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BandErrors {
                operation: "shutdown",
                failures,
            })
        }
    }

    /// Extra environment for a spawn, beyond the synthesized `.env`.
    async fn spawn_env(&self, entry: &crate::registry::ServiceEntry) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if entry.process_kind == ProcessKind::ExternalJava {
            // The identity provider bootstraps its own admin account from
            // the environment on first start.
            let master = self.master.read().await;
            env.insert(
                "IDP_ADMIN".to_string(),
                master.identity_provider.admin_username.clone(),
            );
            env.insert(
                "IDP_ADMIN_PASSWORD".to_string(),
                master.identity_provider.admin_password.clone(),
            );
        }
        env
    }
}

fn signal_pid(pid: u32, signal: Signal) -> nix::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| nix::errno::Errno::EINVAL)?;
    kill(Pid::from_raw(raw), signal)
}

/// Recover the exit code of a dead child, when it is still waitable.
/// Processes adopted from a previous orchestrator run are reaped by init,
/// so `None` is the common case after a crash.
fn reap_exit_code(pid: u32) -> Option<i32> {
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    let raw = i32::try_from(pid).ok()?;
    match waitpid(Pid::from_raw(raw), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Some(code),
        _ => None,
    }
}

/// Last `max_bytes` of a file, lossily decoded.
fn tail_file(path: &std::path::Path, max_bytes: usize) -> String {
    let Ok(raw) = std::fs::read(path) else {
        return String::new();
    };
    let start = raw.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&raw[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::registry::{RunEntrypoint, ServiceEntry, ServiceSource};

    fn shell_service(parent: &Path, name: &str, port: u16, order: u32, body: &str) -> ServiceEntry {
        let dir = parent.join(format!("helm-{name}"));
        fs::create_dir_all(&dir).unwrap();
        let script = dir.join("run.sh");
        fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        }
        ServiceEntry {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            source: ServiceSource::Discovered,
            port,
            dependencies: BTreeSet::new(),
            install_order: order,
            git_url: None,
            directory_path: dir,
            process_kind: ProcessKind::ManagedPython,
            run_entrypoint: RunEntrypoint::Command {
                command: "run.sh".to_string(),
            },
            visible: true,
            admin_only: false,
        }
    }

    fn fast_timings() -> SupervisorTimings {
        SupervisorTimings {
            readiness_window: Duration::from_millis(300),
            start_deadline: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
        }
    }

    fn supervisor_over(
        dir: &tempfile::TempDir,
        entries: Vec<ServiceEntry>,
    ) -> (HelmPaths, Arc<Supervisor>) {
        let base = dir.path().join("helm");
        fs::create_dir_all(&base).unwrap();
        let paths = HelmPaths::new(&base);
        let catalog = Arc::new(ServiceCatalog::from_entries(entries).unwrap());
        let master = Arc::new(RwLock::new(MasterConfig::default()));
        let supervisor = Arc::new(
            Supervisor::new(paths.clone(), catalog, master).with_timings(fast_timings()),
        );
        (paths, supervisor)
    }

    #[tokio::test]
    async fn test_start_stop_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let entry = shell_service(dir.path(), "alpha", 59741, 10, "sleep 30");
        let (paths, supervisor) = supervisor_over(&dir, vec![entry]);

        let record = supervisor
            .start("alpha", SpawnMode::Development)
            .await
            .unwrap();
        assert_eq!(record.status, ProcessState::Running);
        let pid = record.pid.unwrap();
        assert!(pidfile::alive(pid));
        assert_eq!(pidfile::read(&paths.pidfile("alpha")), Some(pid));

        let record = supervisor.stop("alpha").await.unwrap();
        assert_eq!(record.status, ProcessState::Stopped);
        assert!(record.pid.is_none());
        assert!(!pidfile::alive(pid));
        assert_eq!(pidfile::read(&paths.pidfile("alpha")), None);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let entry = shell_service(dir.path(), "alpha", 59742, 10, "sleep 30");
        let (_paths, supervisor) = supervisor_over(&dir, vec![entry]);

        let record = supervisor.stop("alpha").await.unwrap();
        assert_eq!(record.status, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_start_rejects_foreign_port_holder() {
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let entry = shell_service(dir.path(), "alpha", port, 10, "sleep 30");
        let (paths, supervisor) = supervisor_over(&dir, vec![entry]);

        let err = supervisor
            .start("alpha", SpawnMode::Development)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::PortInUse { .. }));

        // No pidfile was written and the record carries the error kind.
        assert_eq!(pidfile::read(&paths.pidfile("alpha")), None);
        let record = supervisor.status("alpha").await.unwrap();
        assert_eq!(record.status, ProcessState::Error);
        assert_eq!(record.last_error_message.as_deref(), Some("port_in_use"));
    }

    #[tokio::test]
    async fn test_early_death_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let entry = shell_service(dir.path(), "alpha", 59743, 10, "exit 3");
        let (paths, supervisor) = supervisor_over(&dir, vec![entry]);

        let err = supervisor
            .start("alpha", SpawnMode::Development)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessError::DiedDuringStartup { exit_code: Some(3) }
        ));
        assert_eq!(pidfile::read(&paths.pidfile("alpha")), None);

        let record = supervisor.status("alpha").await.unwrap();
        assert_eq!(record.status, ProcessState::Error);
        assert_eq!(record.last_exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_crash_detection_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let entry = shell_service(dir.path(), "beta", 59744, 10, "sleep 30");
        let (_paths, supervisor) = supervisor_over(&dir, vec![entry]);

        let record = supervisor
            .start("beta", SpawnMode::Development)
            .await
            .unwrap();
        let pid = record.pid.unwrap();

        // Simulate an external kill -9.
        signal_pid(pid, Signal::SIGKILL).unwrap();
        while pidfile::alive(pid) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let report = supervisor.detect_crash("beta").await.unwrap();
        assert_eq!(report.pid, pid);
        let record = supervisor.status("beta").await.unwrap();
        assert_eq!(record.status, ProcessState::Error);
        assert_eq!(record.last_error_message.as_deref(), Some("crashed"));

        // A subsequent start succeeds.
        let record = supervisor
            .start("beta", SpawnMode::Development)
            .await
            .unwrap();
        assert_eq!(record.status, ProcessState::Running);
        supervisor.stop("beta").await.unwrap();
    }

    #[tokio::test]
    async fn test_adoption_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let entry = shell_service(dir.path(), "gamma", 59745, 10, "sleep 30");
        let (paths, supervisor) = supervisor_over(&dir, vec![entry.clone()]);

        let pid = supervisor
            .start("gamma", SpawnMode::Development)
            .await
            .unwrap()
            .pid
            .unwrap();

        // A fresh supervisor (simulating an orchestrator restart) adopts
        // the live process from its pidfile.
        let catalog = Arc::new(ServiceCatalog::from_entries(vec![entry]).unwrap());
        let master = Arc::new(RwLock::new(MasterConfig::default()));
        let fresh = Arc::new(
            Supervisor::new(paths.clone(), catalog, master).with_timings(fast_timings()),
        );
        fresh.adopt_all().await;

        let record = fresh.status("gamma").await.unwrap();
        assert_eq!(record.status, ProcessState::Running);
        assert_eq!(record.pid, Some(pid));

        fresh.stop("gamma").await.unwrap();
    }

    #[tokio::test]
    async fn test_adoption_removes_dead_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let entry = shell_service(dir.path(), "delta", 59746, 10, "sleep 30");
        let (paths, supervisor) = supervisor_over(&dir, vec![entry]);

        pidfile::write(&paths.pidfile("delta"), 999_999_998).unwrap();
        supervisor.adopt_all().await;

        assert_eq!(pidfile::read(&paths.pidfile("delta")), None);
        let record = supervisor.status("delta").await.unwrap();
        assert_eq!(record.status, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_running_services() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            shell_service(dir.path(), "x", 59747, 3, "sleep 30"),
            shell_service(dir.path(), "y", 59748, 3, "sleep 30"),
            shell_service(dir.path(), "z", 59749, 2, "sleep 30"),
        ];
        let (_paths, supervisor) = supervisor_over(&dir, entries);

        for name in ["x", "y", "z"] {
            supervisor.start(name, SpawnMode::Development).await.unwrap();
        }

        supervisor.shutdown_all().await.unwrap();

        for name in ["x", "y", "z"] {
            let record = supervisor.status(name).await.unwrap();
            assert_eq!(record.status, ProcessState::Stopped, "{name} not stopped");
        }
    }
}
