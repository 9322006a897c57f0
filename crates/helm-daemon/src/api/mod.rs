//! Control API.
//!
//! One axum router serves the whole surface. Every route except
//! `GET /health` sits behind the authorization middleware, which resolves
//! the bearer token into a [`helm_core::auth::Principal`] before the
//! handler runs.

pub mod auth;
pub mod error;
pub mod handlers;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};

use crate::state::SharedState;

/// Build the control API router.
#[must_use]
pub fn router(state: SharedState) -> Router {
    let authed = Router::new()
        .route("/services", get(handlers::list_services))
        .route("/services/status", get(handlers::all_status))
        .route("/services/{name}/status", get(handlers::one_status))
        .route("/services/{name}/start", post(handlers::start_service))
        .route("/services/{name}/stop", post(handlers::stop_service))
        .route("/services/{name}/restart", post(handlers::restart_service))
        .route("/logs/ingest", post(handlers::ingest_logs))
        .route("/logs", get(handlers::query_logs))
        .route("/logs/{id}", get(handlers::get_log))
        .route("/metrics/{name}", get(handlers::service_metrics))
        .route("/dashboard/status", get(handlers::dashboard_status))
        .layer(from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        .route("/health", get(handlers::orchestrator_health))
        .merge(authed)
        .with_state(state)
}
