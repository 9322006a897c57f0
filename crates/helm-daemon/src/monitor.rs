//! Health-monitor loop.
//!
//! Every tick, each registered service is probed on its own task; the
//! probes for one service run sequentially (process, port, HTTP,
//! resources). Results land in the shared status map and the metric
//! table. A process that vanished without a stop request is flipped to
//! `error` by the supervisor's crash detection, and an `ERROR` log entry
//! with the stderr tail is written on the crashed service's behalf.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use helm_core::health::resources::ResourceSampler;
use helm_core::health::{HealthState, HttpProber, ServiceStatus, port_open};
use helm_core::store::{LogBatch, MetricSample, NewLogEntry};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::state::SharedState;

/// Default probe interval.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-call HTTP probe timeout.
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Port probe timeout.
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Minimum spacing between WARNING log entries for one unreachable
/// service, so a wedged service cannot flood the log store.
const HEALTH_WARN_WINDOW: Duration = Duration::from_secs(60);

/// The monitor loop.
pub struct Monitor {
    state: SharedState,
    interval: Duration,
    prober: HttpProber,
    samplers: Mutex<HashMap<String, ResourceSampler>>,
    last_health_warn: Mutex<HashMap<String, Instant>>,
}

impl Monitor {
    /// Create a monitor over the shared state.
    #[must_use]
    pub fn new(state: SharedState, interval: Duration) -> Self {
        Self {
            state,
            interval,
            prober: HttpProber::new(HTTP_PROBE_TIMEOUT),
            samplers: Mutex::new(HashMap::new()),
            last_health_warn: Mutex::new(HashMap::new()),
        }
    }

    /// Run until the process exits. Ticks start on a fixed cadence; a
    /// tick that overruns delays the next one rather than stacking.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One probe pass over every service, concurrently.
    pub async fn tick(self: &Arc<Self>) {
        let names: Vec<String> = self
            .state
            .catalog
            .names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut set = JoinSet::new();
        for name in names {
            let monitor = Arc::clone(self);
            set.spawn(async move {
                monitor.probe_service(&name).await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Sequential probes for one service.
    async fn probe_service(&self, name: &str) {
        let Some(entry) = self.state.catalog.get(name).cloned() else {
            return;
        };

        // Process probe, with crash detection.
        if let Some(crash) = self.state.supervisor.detect_crash(name).await {
            error!(
                service = %name,
                pid = crash.pid,
                exit_code = ?crash.exit_code,
                "process died unexpectedly"
            );
            self.record_crash(name, &crash);
        }

        let Ok(record) = self.state.supervisor.status(name).await else {
            return;
        };

        let mut health = HealthState::Unknown;
        let mut health_message = String::new();
        let mut cpu_percent = None;
        let mut memory_mb = None;

        if record.status.is_running() {
            // Port probe, then HTTP probe; health is computed only for a
            // running process.
            if port_open(entry.port, PORT_PROBE_TIMEOUT).await {
                let report = self.prober.probe(&entry.local_url()).await;
                health = report.health;
                health_message = report.message;
            } else {
                health = HealthState::Unreachable;
                health_message = format!("port {} not accepting connections", entry.port);
            }

            if health == HealthState::Unreachable {
                self.note_unreachable(name, &health_message).await;
            }

            // Resource sample.
            if let Some(pid) = record.pid {
                if let Some(sample) = self.sample_resources(name, pid).await {
                    cpu_percent = Some(sample.cpu_percent);
                    memory_mb = Some(sample.memory_mb);
                    self.record_metrics(name, sample.cpu_percent, sample.memory_mb);
                }
            }
        }

        let mut statuses = self.state.statuses.write().await;
        statuses.insert(
            name.to_string(),
            ServiceStatus {
                service_name: name.to_string(),
                status: record.status,
                pid: record.pid,
                port: entry.port,
                started_at: record.started_at,
                last_checked: Utc::now(),
                health,
                health_message,
                cpu_percent,
                memory_mb,
            },
        );
    }

    async fn sample_resources(
        &self,
        name: &str,
        pid: u32,
    ) -> Option<helm_core::health::resources::ResourceSample> {
        let mut samplers = self.samplers.lock().await;
        let sampler = samplers
            .entry(name.to_string())
            .or_insert_with(|| ResourceSampler::new(pid));
        if sampler.pid() != pid {
            *sampler = ResourceSampler::new(pid);
        }
        sampler.sample()
    }

    fn record_metrics(&self, name: &str, cpu_percent: f64, memory_mb: f64) {
        let now = Utc::now();
        for (metric_name, value) in [("cpu_percent", cpu_percent), ("memory_mb", memory_mb)] {
            let sample = MetricSample {
                service_name: name.to_string(),
                timestamp: now,
                metric_name: metric_name.to_string(),
                value,
                tags: None,
            };
            if let Err(e) = self.state.store.record_metric(&sample) {
                warn!(service = %name, "failed to record metric: {e}");
            }
        }
    }

    /// Write the crash as an ERROR log entry on the service's behalf.
    fn record_crash(&self, name: &str, crash: &helm_core::supervisor::CrashReport) {
        let batch = LogBatch {
            service_name: name.to_string(),
            logs: vec![NewLogEntry {
                level: "ERROR".to_string(),
                message: format!("process {} died unexpectedly", crash.pid),
                timestamp: Some(Utc::now()),
                context: Some(serde_json::json!({
                    "pid": crash.pid,
                    "exit_code": crash.exit_code,
                    "stderr_tail": crash.stderr_tail,
                })),
                trace_id: None,
                user_id: None,
                hostname: None,
                process_id: Some(i64::from(crash.pid)),
            }],
        };
        if let Err(e) = self.state.store.ingest_batch(&batch) {
            warn!(service = %name, "failed to record crash log entry: {e}");
        }
    }

    /// Rate-limited WARNING entry for an unreachable service.
    async fn note_unreachable(&self, name: &str, message: &str) {
        let mut last = self.last_health_warn.lock().await;
        let now = Instant::now();
        if let Some(at) = last.get(name) {
            if now.duration_since(*at) < HEALTH_WARN_WINDOW {
                debug!(service = %name, "still unreachable: {message}");
                return;
            }
        }
        last.insert(name.to_string(), now);

        let batch = LogBatch {
            service_name: name.to_string(),
            logs: vec![NewLogEntry {
                level: "WARNING".to_string(),
                message: format!("health probe failed: {message}"),
                timestamp: Some(Utc::now()),
                context: None,
                trace_id: None,
                user_id: None,
                hostname: None,
                process_id: None,
            }],
        };
        if let Err(e) = self.state.store.ingest_batch(&batch) {
            warn!(service = %name, "failed to record health warning: {e}");
        }
    }
}
