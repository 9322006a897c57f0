//! helm-daemon - the Helm orchestrator.
//!
//! Boot sequence:
//!
//! 1. Load the master configuration (a malformed file is fatal — the
//!    administrator must repair it, the daemon never guesses).
//! 2. Re-detect the hostname; a change is recorded and triggers an
//!    identity-provider reconcile.
//! 3. Reconcile the service catalog from the manifest plus a filesystem
//!    scan, and write the thin/thick registry projections.
//! 4. Synthesize every service's env and connection files.
//! 5. Open the log store and start the retention sweep.
//! 6. Run the identity-provider bootstrap when triggered. On a fresh
//!    install a bootstrap failure is fatal; on an existing install the
//!    daemon keeps serving and marks the provider degraded.
//! 7. Adopt processes left running by a previous orchestrator from their
//!    pidfiles, then start the remaining services in install-order bands.
//! 8. Serve the control API and run the monitor loop until SIGTERM or
//!    SIGINT, then stop everything in reverse bands.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use helm_core::config::{ConfigStore, MasterConfig, detect_hostname};
use helm_core::idp::{IdpAdminClient, ReconcileKind, detect_triggers, reconcile_kind};
use helm_core::paths::HelmPaths;
use helm_core::process::{ProcessError, SpawnMode};
use helm_core::registry::{ProcessKind, ServiceCatalog, ServiceRegistry, projection};
use helm_core::store::Store;
use helm_core::supervisor::Supervisor;
use helm_core::synth;
use helm_daemon::api;
use helm_daemon::monitor::Monitor;
use helm_daemon::retention;
use helm_daemon::state::{AppState, SharedState};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// helm-daemon - platform orchestrator
#[derive(Parser, Debug)]
#[command(name = "helm-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Orchestrator base directory (holds the manifest, instance/, pids/,
    /// logs/; services live in its parent directory)
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,

    /// Control API port
    #[arg(long, default_value = "5004")]
    port: u16,

    /// Log level (trace, debug, info, warn, error); overrides `LOG_LEVEL`
    #[arg(long)]
    log_level: Option<String>,

    /// Health probe interval (humantime syntax, e.g. "5s", "500ms")
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    probe_interval: Duration,

    /// Log retention horizon in days
    #[arg(long, default_value = "90")]
    retention_days: u32,

    /// Do not start managed services at boot
    #[arg(long)]
    no_autostart: bool,

    /// Skip the identity-provider bootstrap even when triggered
    #[arg(long)]
    skip_bootstrap: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = args
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(filter.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let base_dir = args
        .base_dir
        .canonicalize()
        .with_context(|| format!("base directory not found: {}", args.base_dir.display()))?;
    let paths = HelmPaths::new(base_dir);

    // 1. Master configuration. Malformed is fatal by design.
    let config_store = Arc::new(ConfigStore::new(&paths));
    let mut master = config_store
        .load()
        .context("cannot start with a malformed master configuration")?;

    // 2. Catalog, before trigger detection: whether the identity provider
    //    is installed depends on the scan.
    let registry = ServiceRegistry::load(&paths).context("failed to load service manifest")?;
    let catalog = Arc::new(registry.reconcile().context("catalog reconciliation failed")?);
    catalog
        .write_projections(&paths)
        .context("failed to write registry projections")?;
    info!(services = catalog.len(), "catalog reconciled");

    // 3. Hostname re-detection and bootstrap triggers.
    let idp_installed = catalog
        .iter()
        .any(|e| e.process_kind == ProcessKind::ExternalJava);
    let detected = detect_hostname();
    let triggers = detect_triggers(&master, idp_installed, &detected);
    let fresh_install = master.identity_provider.client_secret.is_none();
    if master.system.hostname != detected {
        info!(
            old = %master.system.hostname,
            new = %detected,
            "hostname changed since last boot"
        );
        master.system.hostname = detected;
        config_store.save(&master)?;
    }

    // 4. Per-service configuration.
    synthesize_all(&master, &catalog, &paths);

    // 5. Store and shared state.
    let store = Store::open(&paths.store_file()).context("failed to open log store")?;
    let identity_url = std::env::var("CORE_SERVICE_URL").unwrap_or_else(|_| {
        catalog
            .get(helm_core::IDENTITY_SERVICE)
            .map_or_else(|| "http://localhost:5000".to_string(), |e| e.local_url())
    });

    let master = Arc::new(RwLock::new(master));
    let supervisor = Arc::new(Supervisor::new(
        paths.clone(),
        Arc::clone(&catalog),
        Arc::clone(&master),
    ));
    let state: SharedState = Arc::new(AppState {
        statuses: Arc::new(RwLock::new(AppState::initial_statuses(&catalog))),
        paths: paths.clone(),
        config_store: Arc::clone(&config_store),
        master: Arc::clone(&master),
        catalog: Arc::clone(&catalog),
        supervisor: Arc::clone(&supervisor),
        store,
        verifier: Arc::new(helm_core::auth::TokenVerifier::new(identity_url)),
        started_at: chrono::Utc::now(),
        idp_degraded: Arc::new(AtomicBool::new(false)),
    });

    // 6. Adopt anything a previous orchestrator left running.
    supervisor.adopt_all().await;

    // 7. Identity-provider reconcile.
    let kind = reconcile_kind(&triggers);
    if args.skip_bootstrap {
        if kind != ReconcileKind::None {
            warn!("identity provider reconcile is due but --skip-bootstrap is set");
        }
    } else if let Err(e) = reconcile_identity_provider(&state, kind).await {
        if fresh_install {
            // A fresh install without a working identity provider cannot
            // authorize anything; refuse to run half-configured.
            bail!("identity provider bootstrap failed on fresh install: {e:#}");
        }
        error!("identity provider reconcile failed, continuing degraded: {e:#}");
        state.idp_degraded.store(true, Ordering::Relaxed);
    }

    // 8. Start managed services in install-order bands.
    if args.no_autostart {
        info!("autostart disabled; services must be started explicitly");
    } else {
        let mode = SpawnMode::from_env();
        if let Err(band_errors) = supervisor.startup_all(mode).await {
            for (service, kind) in &band_errors.failures {
                error!(service, kind, "service failed to start at boot");
            }
        }
    }

    // 9. Background tasks.
    let monitor = Arc::new(Monitor::new(
        Arc::clone(&state),
        args.probe_interval.max(Duration::from_millis(250)),
    ));
    tokio::spawn(Arc::clone(&monitor).run());
    tokio::spawn(retention::run(Arc::clone(&state), args.retention_days));

    // 10. Control API.
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control API on {addr}"))?;
    info!(%addr, "control API listening");

    axum::serve(listener, api::router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control API server failed")?;

    // 11. Orderly shutdown in reverse bands.
    info!("stopping all services");
    if let Err(band_errors) = supervisor.shutdown_all().await {
        for (service, kind) in &band_errors.failures {
            error!(service, kind, "service failed to stop during shutdown");
        }
    }
    info!("orchestrator exiting");
    Ok(())
}

/// Synthesize env and connection files for every catalog service.
fn synthesize_all(master: &MasterConfig, catalog: &ServiceCatalog, paths: &HelmPaths) {
    let thin = match projection::load_thin_registry(paths) {
        Ok(thin) => thin,
        Err(e) => {
            warn!("cannot load thin registry for synthesis: {e}");
            BTreeMap::new()
        }
    };
    for entry in catalog.iter() {
        if let Err(e) = synth::write_service_config(master, entry, &thin) {
            warn!(service = %entry.name, "config synthesis failed: {e}");
        }
    }
}

/// Run the identity-provider reconcile the triggers call for.
async fn reconcile_identity_provider(state: &SharedState, kind: ReconcileKind) -> Result<()> {
    if kind == ReconcileKind::None {
        return Ok(());
    }

    let Some(idp_entry) = state
        .catalog
        .iter()
        .find(|e| e.process_kind == ProcessKind::ExternalJava)
        .cloned()
    else {
        bail!("identity provider is not installed; run the installer first");
    };

    // The admin API only answers once the provider process is up.
    match state
        .supervisor
        .start(&idp_entry.name, SpawnMode::Production)
        .await
    {
        Ok(_) | Err(ProcessError::AlreadyRunning { .. }) => {}
        Err(e) => bail!("failed to start the identity provider: {e}"),
    }

    let (idp_config, hostname) = {
        let master = state.master.read().await;
        (master.identity_provider.clone(), master.system.hostname.clone())
    };
    let client = IdpAdminClient::new(&idp_config)?;
    wait_for_idp(&client).await?;

    match kind {
        ReconcileKind::None => {}
        ReconcileKind::HostnameOnly => {
            client.reconcile_hostname(&hostname).await?;
        }
        ReconcileKind::Full => {
            let report = client.bootstrap(&hostname).await?;

            // Persist the client secret, then regenerate every service's
            // config so they pick it up.
            let updated = {
                let mut master = state.master.write().await;
                master.identity_provider.client_secret = Some(report.client_secret);
                state.config_store.save(&master)?;
                master.clone()
            };
            synthesize_all(&updated, &state.catalog, &state.paths);
            if !report.groups_created.is_empty() {
                info!(groups = ?report.groups_created, "created permission groups");
            }
            info!("running services need a restart to pick up the new client secret");
        }
    }
    Ok(())
}

/// Poll the admin API until it answers, bounded.
async fn wait_for_idp(client: &IdpAdminClient) -> Result<()> {
    const WAIT_LIMIT: Duration = Duration::from_secs(90);
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;

    while tokio::time::Instant::now() < deadline {
        if client.is_reachable().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    bail!("identity provider admin API did not come up within {WAIT_LIMIT:?}")
}

async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = term.recv() => info!("SIGTERM received"),
        _ = int.recv() => info!("SIGINT received"),
    }
}
