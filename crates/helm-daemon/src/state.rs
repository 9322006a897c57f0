//! Shared daemon state.
//!
//! One [`AppState`] is built at boot and handed by `Arc` to the control
//! API handlers, the monitor loop, and the retention task. No
//! module-level mutable state exists anywhere in the daemon.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Utc};
use helm_core::auth::TokenVerifier;
use helm_core::config::{ConfigStore, MasterConfig};
use helm_core::health::{HealthState, ServiceStatus};
use helm_core::paths::HelmPaths;
use helm_core::process::ProcessState;
use helm_core::registry::ServiceCatalog;
use helm_core::store::Store;
use helm_core::supervisor::Supervisor;
use tokio::sync::RwLock;

/// Shared daemon state.
pub struct AppState {
    /// Filesystem layout.
    pub paths: HelmPaths,
    /// Persistent master-config store.
    pub config_store: Arc<ConfigStore>,
    /// In-memory master configuration snapshot. Writers hold the write
    /// lock only long enough to swap the document.
    pub master: Arc<RwLock<MasterConfig>>,
    /// The reconciled service catalog (immutable for this boot).
    pub catalog: Arc<ServiceCatalog>,
    /// Process supervisor.
    pub supervisor: Arc<Supervisor>,
    /// Log/metric store.
    pub store: Store,
    /// Monitor-owned status rows.
    pub statuses: Arc<RwLock<BTreeMap<String, ServiceStatus>>>,
    /// Bearer-token verifier.
    pub verifier: Arc<TokenVerifier>,
    /// When this daemon started.
    pub started_at: DateTime<Utc>,
    /// Set when identity-provider bootstrap failed on an existing
    /// install; the dashboard shows the provider as degraded.
    pub idp_degraded: Arc<AtomicBool>,
}

/// Shared handle passed to handlers and background tasks.
pub type SharedState = Arc<AppState>;

impl AppState {
    /// Initial status rows: every catalog service stopped/unknown until
    /// the first monitor tick.
    #[must_use]
    pub fn initial_statuses(catalog: &ServiceCatalog) -> BTreeMap<String, ServiceStatus> {
        catalog
            .iter()
            .map(|entry| {
                (
                    entry.name.clone(),
                    ServiceStatus {
                        service_name: entry.name.clone(),
                        status: ProcessState::Stopped,
                        pid: None,
                        port: entry.port,
                        started_at: None,
                        last_checked: Utc::now(),
                        health: HealthState::Unknown,
                        health_message: String::new(),
                        cpu_percent: None,
                        memory_mb: None,
                    },
                )
            })
            .collect()
    }
}
