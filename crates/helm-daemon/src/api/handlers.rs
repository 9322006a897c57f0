//! Control API handlers.
//!
//! Handlers are thin: resolve arguments, consult the principal, call into
//! the supervisor or store, and map results onto the wire shapes. All
//! state arrives by reference through [`SharedState`]; the principal
//! arrives through request extensions, resolved once by the auth
//! middleware.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use chrono::{DateTime, Duration, Utc};
use helm_core::auth::Principal;
use helm_core::health::{HealthPayload, HealthState, ServiceStatus};
use helm_core::process::SpawnMode;
use helm_core::store::{LogEntry, LogLevel, LogQuery, MetricSample, NewLogEntry};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::auth::require_admin;
use super::error::ApiError;
use crate::state::SharedState;

/// Body of start/restart requests.
#[derive(Debug, Default, Deserialize)]
pub struct ControlRequest {
    /// Spawn mode; defaults to the host's `DEV_MODE` setting.
    pub mode: Option<String>,
}

/// Body of `POST /logs/ingest`.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    /// Originating service. Optional for service tokens, which default to
    /// the calling service.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Entries in submission order.
    pub logs: Vec<NewLogEntry>,
}

/// Response of `POST /logs/ingest`.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Entries persisted.
    pub accepted: u64,
}

/// Query parameters of `GET /logs`.
#[derive(Debug, Default, Deserialize)]
pub struct LogQueryParams {
    /// Restrict to one service.
    pub service: Option<String>,
    /// Minimum severity (inclusive).
    pub level: Option<String>,
    /// RFC 3339 lower bound.
    pub start_time: Option<String>,
    /// RFC 3339 upper bound.
    pub end_time: Option<String>,
    /// Restrict to one trace.
    pub trace_id: Option<String>,
    /// Restrict to one user.
    pub user_id: Option<String>,
    /// Page size (max 1000).
    pub limit: Option<u32>,
    /// Page offset.
    pub offset: Option<u32>,
}

/// Page of log entries.
#[derive(Debug, Serialize)]
pub struct LogPage {
    /// Applied page size.
    pub limit: u32,
    /// Applied offset.
    pub offset: u32,
    /// Entries, newest first.
    pub logs: Vec<LogEntry>,
}

/// Query parameters of `GET /metrics/{name}`.
#[derive(Debug, Default, Deserialize)]
pub struct MetricQueryParams {
    /// Restrict to one metric name.
    pub metric_name: Option<String>,
    /// RFC 3339 lower bound; defaults to 24 hours ago.
    pub start_time: Option<String>,
    /// RFC 3339 upper bound; defaults to now.
    pub end_time: Option<String>,
    /// Page size (max 1000).
    pub limit: Option<u32>,
}

/// `GET /services` — the full catalog.
pub async fn list_services(
    State(state): State<SharedState>,
) -> Json<serde_json::Value> {
    let details: BTreeMap<&str, &helm_core::registry::ServiceEntry> = state
        .catalog
        .iter()
        .map(|entry| (entry.name.as_str(), entry))
        .collect();
    Json(json!({
        "services": state.catalog.names(),
        "details": details,
    }))
}

/// `GET /services/status` — status rows for every service.
pub async fn all_status(
    State(state): State<SharedState>,
) -> Json<BTreeMap<String, ServiceStatus>> {
    Json(merged_statuses(&state).await)
}

/// `GET /services/{name}/status`.
pub async fn one_status(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceStatus>, ApiError> {
    merged_status(&state, &name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("service '{name}'")))
}

/// `POST /services/{name}/start`.
pub async fn start_service(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Extension(principal): Extension<Principal>,
    body: Option<Json<ControlRequest>>,
) -> Result<Json<ServiceStatus>, ApiError> {
    require_admin(&principal)?;
    let mode = parse_mode(body.as_ref().map(|Json(b)| b))?;

    state.supervisor.start(&name, mode).await?;
    status_after_change(&state, &name).await
}

/// `POST /services/{name}/stop`.
pub async fn stop_service(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<ServiceStatus>, ApiError> {
    require_admin(&principal)?;
    state.supervisor.stop(&name).await?;
    status_after_change(&state, &name).await
}

/// `POST /services/{name}/restart`.
pub async fn restart_service(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Extension(principal): Extension<Principal>,
    body: Option<Json<ControlRequest>>,
) -> Result<Json<ServiceStatus>, ApiError> {
    require_admin(&principal)?;
    let mode = parse_mode(body.as_ref().map(|Json(b)| b))?;

    state.supervisor.restart(&name, mode).await?;
    status_after_change(&state, &name).await
}

/// `POST /logs/ingest`.
pub async fn ingest_logs(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let service_name = match (&request.service_name, &principal) {
        (Some(name), _) => name.clone(),
        (None, Principal::Service(service)) => service.calling_service.clone(),
        (None, Principal::User(_)) => {
            return Err(ApiError::BadRequest("service_name is required".to_string()));
        }
    };

    let batch = helm_core::store::LogBatch {
        service_name,
        logs: request.logs,
    };
    let accepted = state.store.ingest_batch(&batch)?;
    Ok(Json(IngestResponse { accepted }))
}

/// `GET /logs`.
pub async fn query_logs(
    State(state): State<SharedState>,
    Query(params): Query<LogQueryParams>,
) -> Result<Json<LogPage>, ApiError> {
    let query = LogQuery {
        service_name: params.service,
        min_level: params
            .level
            .map(|raw| raw.parse::<LogLevel>().map_err(ApiError::BadRequest))
            .transpose()?,
        start_time: parse_time(params.start_time.as_deref(), "start_time")?,
        end_time: parse_time(params.end_time.as_deref(), "end_time")?,
        trace_id: params.trace_id,
        user_id: params.user_id,
        limit: params.limit.unwrap_or(100),
        offset: params.offset.unwrap_or(0),
    };

    let logs = state.store.query_logs(&query)?;
    Ok(Json(LogPage {
        limit: query.limit.min(helm_core::store::MAX_QUERY_LIMIT),
        offset: query.offset,
        logs,
    }))
}

/// `GET /logs/{id}`.
pub async fn get_log(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<LogEntry>, ApiError> {
    state
        .store
        .get_log(id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("log entry {id}")))
}

/// `GET /metrics/{name}`.
pub async fn service_metrics(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Query(params): Query<MetricQueryParams>,
) -> Result<Json<Vec<MetricSample>>, ApiError> {
    if !state.catalog.contains(&name) {
        return Err(ApiError::NotFound(format!("service '{name}'")));
    }

    let end = parse_time(params.end_time.as_deref(), "end_time")?.unwrap_or_else(Utc::now);
    let start = parse_time(params.start_time.as_deref(), "start_time")?
        .unwrap_or_else(|| end - Duration::hours(24));

    let samples = state.store.query_metrics(
        &name,
        start,
        end,
        params.metric_name.as_deref(),
        params.limit.unwrap_or(100),
    )?;
    Ok(Json(samples))
}

/// `GET /dashboard/status` — aggregated view for the UI.
pub async fn dashboard_status(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let statuses = merged_statuses(&state).await;
    let log_stats = state
        .store
        .level_counts_since(Utc::now() - Duration::hours(1))?;

    Ok(Json(json!({
        "statuses": statuses,
        "log_stats": log_stats,
        "identity_provider": {
            "degraded": state
                .idp_degraded
                .load(std::sync::atomic::Ordering::Relaxed),
        },
    })))
}

/// `GET /health` — the orchestrator's own health. Unauthenticated.
pub async fn orchestrator_health(State(state): State<SharedState>) -> Json<HealthPayload> {
    let idp_degraded = state
        .idp_degraded
        .load(std::sync::atomic::Ordering::Relaxed);
    let store_ok = state.store.get_log(i64::MAX).is_ok();

    let mut checks = BTreeMap::new();
    checks.insert(
        "identity_provider".to_string(),
        if idp_degraded { "degraded" } else { "healthy" }.to_string(),
    );
    checks.insert(
        "log_store".to_string(),
        if store_ok { "healthy" } else { "degraded" }.to_string(),
    );

    let status = if idp_degraded || !store_ok {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthPayload {
        service: "helm".to_string(),
        status: status.to_string(),
        timestamp: Utc::now(),
        checks: Some(checks),
    })
}

fn parse_mode(body: Option<&ControlRequest>) -> Result<SpawnMode, ApiError> {
    match body.and_then(|b| b.mode.as_deref()) {
        Some(raw) => raw.parse().map_err(ApiError::BadRequest),
        None => Ok(SpawnMode::from_env()),
    }
}

fn parse_time(
    raw: Option<&str>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ApiError::BadRequest(format!("invalid {field}: '{value}'")))
    })
    .transpose()
}

/// One status row: the monitor's latest probe joined with the
/// supervisor's current record.
async fn merged_status(state: &SharedState, name: &str) -> Option<ServiceStatus> {
    let row = state.statuses.read().await.get(name).cloned()?;
    let Ok(record) = state.supervisor.status(name).await else {
        return Some(row);
    };
    Some(ServiceStatus {
        status: record.status,
        pid: record.pid,
        started_at: record.started_at,
        health: if record.status.is_running() {
            row.health
        } else {
            HealthState::Unknown
        },
        ..row
    })
}

async fn merged_statuses(state: &SharedState) -> BTreeMap<String, ServiceStatus> {
    let mut out = BTreeMap::new();
    for name in state.catalog.names() {
        if let Some(status) = merged_status(state, name).await {
            out.insert(name.to_string(), status);
        }
    }
    out
}

async fn status_after_change(
    state: &SharedState,
    name: &str,
) -> Result<Json<ServiceStatus>, ApiError> {
    merged_status(state, name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("service '{name}'")))
}
