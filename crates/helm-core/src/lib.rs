//! # helm-core
//!
//! Core library for Helm - a single-host orchestrator for a fleet of
//! long-running HTTP services plus an external OIDC identity provider.
//!
//! This crate provides the building blocks the daemon and CLI are composed
//! from:
//!
//! - **Service Registry**: manifest-driven catalog plus filesystem discovery
//! - **Config Synthesis**: per-service env and connection files generated
//!   from a single master configuration document
//! - **Process Supervision**: spawn, adopt, stop, and track managed
//!   processes via pidfiles
//! - **Health Probing**: process, port, and HTTP probes with resource
//!   sampling from `/proc`
//! - **Log Store**: append-only log and metric tables with batched ingest
//! - **Token Verification**: JWKS-backed bearer-token authorization
//!
//! ## Example
//!
//! ```rust,no_run
//! use helm_core::paths::HelmPaths;
//! use helm_core::registry::ServiceRegistry;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let paths = HelmPaths::new("/opt/helm");
//! let registry = ServiceRegistry::load(&paths)?;
//! let catalog = registry.reconcile()?;
//! catalog.write_projections(&paths)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod config;
pub mod health;
pub mod idp;
pub mod paths;
pub mod process;
pub mod registry;
pub mod shipper;
pub mod store;
pub mod supervisor;
pub mod synth;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::MasterConfig;
    pub use crate::paths::HelmPaths;
    pub use crate::process::{ProcessRecord, ProcessState, SpawnMode};
    pub use crate::registry::{ServiceCatalog, ServiceEntry, ServiceSource};
    pub use crate::supervisor::Supervisor;
}

/// Re-export commonly used types at the crate root.
pub use config::MasterConfig;
pub use paths::HelmPaths;
pub use process::{ProcessRecord, ProcessState, SpawnMode};
pub use registry::{ServiceCatalog, ServiceEntry};
pub use supervisor::Supervisor;

/// Name of the identity service in the catalog.
///
/// The identity service is special-cased in two places: config synthesis
/// hands it the direct (non-proxied) identity-provider URL and the JWT
/// signing keypair paths, and the daemon consults it for JWKS and session
/// validation.
pub const IDENTITY_SERVICE: &str = "identity";
