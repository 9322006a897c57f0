//! Health probing.
//!
//! Three probe levels, run in order for each service: process liveness,
//! TCP port reachability, and an HTTP `GET /health`. The monitor loop in
//! the daemon drives these; this module provides the primitives and the
//! health-state model.

pub mod resources;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of a running service, as observed by the prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// HTTP probe succeeded and the service reported `healthy`.
    Healthy,
    /// HTTP probe succeeded and the service reported `degraded`.
    Degraded,
    /// Timeout, non-200, or a malformed health payload.
    Unreachable,
    /// Not probed yet, or the service is not running.
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of one HTTP health probe.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Probed health state.
    pub health: HealthState,
    /// Human-readable detail for the dashboard.
    pub message: String,
}

/// Wire shape of a service's `/health` response.
///
/// The `checks` map is optional per-component detail; only `status` is
/// required for the probe verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPayload {
    /// Service name.
    pub service: String,
    /// `healthy`, `degraded`, or anything else (treated as unreachable).
    pub status: String,
    /// When the service produced the payload.
    pub timestamp: DateTime<Utc>,
    /// Optional per-component states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checks: Option<std::collections::BTreeMap<String, String>>,
}

/// Monitor-owned status row for one service: the process record's public
/// face joined with the latest probe results and resource sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Service name.
    pub service_name: String,
    /// Process state from the supervisor.
    pub status: crate::process::ProcessState,
    /// PID when live.
    pub pid: Option<u32>,
    /// Configured port.
    pub port: u16,
    /// When the process started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the monitor last probed this service. Advances monotonically.
    pub last_checked: DateTime<Utc>,
    /// Probed health; meaningful only while `status` is `running`.
    pub health: HealthState,
    /// Human-readable probe detail.
    pub health_message: String,
    /// CPU usage as a percentage of one core.
    pub cpu_percent: Option<f64>,
    /// Resident set size in MiB.
    pub memory_mb: Option<f64>,
}

/// Whether a local TCP port accepts connections within the timeout.
pub async fn port_open(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(
            timeout,
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}

/// HTTP health prober with a bounded per-call timeout.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    /// Create a prober with the given per-call timeout.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialized, which is a
    /// deployment defect rather than a runtime condition.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }

    /// Probe `GET <base_url>/health`.
    ///
    /// `200` with `status: "healthy"` yields [`HealthState::Healthy`];
    /// `200` with `status: "degraded"` yields [`HealthState::Degraded`];
    /// every other outcome (timeout, non-200, missing field) yields
    /// [`HealthState::Unreachable`].
    pub async fn probe(&self, base_url: &str) -> HealthReport {
        let url = format!("{}/health", base_url.trim_end_matches('/'));

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                return HealthReport {
                    health: HealthState::Unreachable,
                    message: format!("no response: {e}"),
                };
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            return HealthReport {
                health: HealthState::Unreachable,
                message: format!("HTTP {} from /health", response.status().as_u16()),
            };
        }

        let payload: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                return HealthReport {
                    health: HealthState::Unreachable,
                    message: format!("malformed health payload: {e}"),
                };
            }
        };

        match payload.get("status").and_then(serde_json::Value::as_str) {
            Some("healthy") => HealthReport {
                health: HealthState::Healthy,
                message: "service reports healthy".to_string(),
            },
            Some("degraded") => HealthReport {
                health: HealthState::Degraded,
                message: degraded_detail(&payload),
            },
            Some(other) => HealthReport {
                health: HealthState::Unreachable,
                message: format!("unexpected status '{other}'"),
            },
            None => HealthReport {
                health: HealthState::Unreachable,
                message: "health payload missing 'status'".to_string(),
            },
        }
    }
}

/// Name the failing components when a service reports degraded.
fn degraded_detail(payload: &serde_json::Value) -> String {
    let failing: Vec<String> = payload
        .get("checks")
        .and_then(serde_json::Value::as_object)
        .map(|checks| {
            checks
                .iter()
                .filter(|(_, v)| v.as_str() != Some("healthy"))
                .map(|(k, v)| format!("{k}={}", v.as_str().unwrap_or("?")))
                .collect()
        })
        .unwrap_or_default();

    if failing.is_empty() {
        "service reports degraded".to_string()
    } else {
        format!("degraded: {}", failing.join(", "))
    }
}
