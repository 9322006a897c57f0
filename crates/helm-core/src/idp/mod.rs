//! Identity-provider bootstrap.
//!
//! The external OIDC server owns its own database; the orchestrator never
//! touches it directly. Instead this module *reconciles*: every step is a
//! find-then-create-or-update against the admin REST API, so a converged
//! provider is never mutated by a re-run.
//!
//! A full reconcile ensures, in order: the realm (with its externally
//! facing frontend URL), the confidential client with authorization-code
//! flow and both localhost and external redirect URIs, the persisted
//! client secret, the four permission groups with a group-membership
//! token mapper, and the default administrator account.

pub mod client;

pub use client::{BootstrapReport, IdpAdminClient};

use crate::config::MasterConfig;

/// Permission groups every installation carries. Group membership is
/// mapped into user tokens and collapses to the permission level.
pub const PERMISSION_GROUPS: [&str; 4] = ["admins", "technicians", "billing", "client"];

/// Default administrator account ensured in the realm.
pub const DEFAULT_ADMIN_USER: &str = "admin";

/// Default administrator password (flagged non-temporary on first
/// install only).
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin";

/// Path segment the reverse proxy serves the identity provider under.
pub const IDP_PUBLIC_PATH: &str = "idp";

/// Externally facing URL of the identity provider behind the proxy.
#[must_use]
pub fn frontend_url(hostname: &str) -> String {
    format!("https://{hostname}/{IDP_PUBLIC_PATH}")
}

/// Redirect URIs registered on the client: the localhost forms for
/// on-host development plus the external hostname form.
#[must_use]
pub fn redirect_uris(hostname: &str) -> Vec<String> {
    let mut uris = vec!["http://localhost:*".to_string()];
    if hostname != "localhost" {
        uris.push(format!("https://{hostname}/*"));
    }
    uris
}

/// Why a reconcile is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapTrigger {
    /// The identity provider's installation directory does not exist yet.
    FreshInstall,
    /// No client secret is persisted in the master configuration.
    MissingClientSecret,
    /// The detected hostname differs from the recorded one.
    HostnameChanged,
}

/// What kind of reconcile the triggers call for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileKind {
    /// Nothing to do.
    None,
    /// Full reconcile: realm, client, secret, groups, admin user.
    Full,
    /// Hostname-only: update the realm frontend URL and the client
    /// redirect URIs; the secret is left alone.
    HostnameOnly,
}

/// Detect which triggers currently hold.
#[must_use]
pub fn detect_triggers(
    master: &MasterConfig,
    idp_installed: bool,
    detected_hostname: &str,
) -> Vec<BootstrapTrigger> {
    let mut triggers = Vec::new();
    if !idp_installed {
        triggers.push(BootstrapTrigger::FreshInstall);
    }
    if master.identity_provider.client_secret.is_none() {
        triggers.push(BootstrapTrigger::MissingClientSecret);
    }
    if master.system.hostname != detected_hostname {
        triggers.push(BootstrapTrigger::HostnameChanged);
    }
    triggers
}

/// Collapse triggers into the reconcile to run.
///
/// A hostname change on an otherwise converged installation only rewrites
/// URLs; any other trigger forces the full procedure.
#[must_use]
pub fn reconcile_kind(triggers: &[BootstrapTrigger]) -> ReconcileKind {
    if triggers.is_empty() {
        return ReconcileKind::None;
    }
    if triggers
        .iter()
        .all(|t| *t == BootstrapTrigger::HostnameChanged)
    {
        return ReconcileKind::HostnameOnly;
    }
    ReconcileKind::Full
}

/// Identity-provider errors.
#[derive(Debug, thiserror::Error)]
pub enum IdpError {
    /// The admin API could not be reached.
    #[error("identity provider unreachable: {0}")]
    Transport(String),

    /// The admin API rejected a request.
    #[error("identity provider API error ({status}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Admin credentials were rejected.
    #[error("identity provider admin authentication failed: {0}")]
    AuthFailed(String),

    /// A response was missing an expected field.
    #[error("malformed identity provider response: {0}")]
    Malformed(String),

    /// A bootstrap step kept failing after its retries.
    #[error("bootstrap step '{step}' failed after {attempts} attempts: {source}")]
    StepExhausted {
        /// Which step gave up.
        step: &'static str,
        /// How many attempts were made.
        attempts: u32,
        /// The final failure.
        #[source]
        source: Box<IdpError>,
    },
}
