//! Service registry and catalog.
//!
//! The authoritative catalog of services is derived from two inputs:
//! a static JSON manifest (`services_manifest.json`) naming the known
//! `core_required` and `default_optional` services plus non-service
//! `system_dependencies`, and a filesystem scan that picks up any peer
//! service present on disk (see [`crate::registry::discovery`]).
//!
//! Two projections of the catalog are written for external consumers
//! (see [`crate::registry::projection`]): a thin registry for peer URL
//! discovery and a thick registry for the supervisor.

pub mod discovery;
pub mod projection;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use discovery::ServiceRegistry;
pub use projection::{ThinEntry, ThinRegistry};

/// Where a catalog entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSource {
    /// Named in the manifest's `core_required` bucket. The platform does
    /// not boot without these.
    CoreRequired,
    /// Named in the manifest's `default_optional` bucket.
    DefaultOptional,
    /// Found on disk but absent from the manifest.
    Discovered,
}

impl std::fmt::Display for ServiceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CoreRequired => write!(f, "core_required"),
            Self::DefaultOptional => write!(f, "default_optional"),
            Self::Discovered => write!(f, "discovered"),
        }
    }
}

/// How a service's process is launched and owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// A Python service spawned from its bundled interpreter.
    ManagedPython,
    /// An external Java process (the identity provider) started by its
    /// own script; output is still captured by the supervisor.
    ExternalJava,
}

/// Command line used to run a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEntrypoint {
    /// Interpreter + script, relative to the service directory.
    Python {
        /// Interpreter path relative to the service directory.
        #[serde(default = "default_interpreter")]
        interpreter: PathBuf,
        /// Entry script relative to the service directory.
        #[serde(default = "default_script")]
        script: PathBuf,
        /// WSGI runner command used in production mode; development mode
        /// runs the script directly.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        production_command: Option<String>,
    },
    /// A literal command line, split on whitespace at spawn time.
    Command {
        /// Command relative to the service directory.
        command: String,
    },
}

fn default_interpreter() -> PathBuf {
    PathBuf::from("pyenv/bin/python")
}

fn default_script() -> PathBuf {
    PathBuf::from("run.py")
}

impl Default for RunEntrypoint {
    fn default() -> Self {
        Self::Python {
            interpreter: default_interpreter(),
            script: default_script(),
            production_command: None,
        }
    }
}

/// One service in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Unique slug (`^[a-z][a-z0-9_-]*$`).
    pub name: String,

    /// Human-readable name for the dashboard.
    pub display_name: String,

    /// Short description.
    #[serde(default)]
    pub description: String,

    /// Which bucket the entry came from.
    pub source: ServiceSource,

    /// TCP port the service listens on. Unique across the catalog.
    pub port: u16,

    /// Names of services (or system-dependency tags) this one needs.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Lower runs earlier on install and startup; shutdown is reversed.
    pub install_order: u32,

    /// Upstream repository, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,

    /// Absolute directory of the service checkout.
    pub directory_path: PathBuf,

    /// How the process is launched.
    pub process_kind: ProcessKind,

    /// Command line used to run the service.
    pub run_entrypoint: RunEntrypoint,

    /// Whether the service appears in the dashboard's side panel.
    #[serde(default)]
    pub visible: bool,

    /// Whether the service is restricted to administrators in the UI.
    #[serde(default)]
    pub admin_only: bool,
}

impl ServiceEntry {
    /// Local URL the service is reached at from this host.
    #[must_use]
    pub fn local_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}

/// Manifest entry: a known service minus the fields derived at reconcile
/// time (`name`, `source`, `directory_path`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Human-readable name.
    pub display_name: String,

    /// Short description.
    #[serde(default)]
    pub description: String,

    /// TCP port.
    pub port: u16,

    /// Dependency names.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Install order.
    #[serde(default = "default_install_order")]
    pub install_order: u32,

    /// Upstream repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,

    /// Process kind.
    #[serde(default = "default_process_kind")]
    pub process_kind: ProcessKind,

    /// Run entrypoint.
    #[serde(default)]
    pub run_entrypoint: RunEntrypoint,

    /// Dashboard visibility.
    #[serde(default)]
    pub visible: bool,

    /// Administrator-only UI flag.
    #[serde(default)]
    pub admin_only: bool,
}

const fn default_install_order() -> u32 {
    50
}

const fn default_process_kind() -> ProcessKind {
    ProcessKind::ManagedPython
}

/// Kind of a non-service system prerequisite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemDependencyKind {
    /// The external OIDC identity provider.
    IdentityProvider,
    /// The relational database server.
    RelationalDatabase,
    /// The optional graph database server.
    GraphDatabase,
}

/// A non-service prerequisite from the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDependency {
    /// What kind of prerequisite this is.
    pub kind: SystemDependencyKind,

    /// Short description.
    #[serde(default)]
    pub description: String,

    /// Directory name under the parent directory, for prerequisites that
    /// are supervised as external processes (the identity provider).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    /// Port the prerequisite listens on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Start command relative to the prerequisite's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
}

/// The static service manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Services the platform cannot run without.
    #[serde(default)]
    pub core_required: BTreeMap<String, ManifestEntry>,

    /// Services installed by default but removable.
    #[serde(default)]
    pub default_optional: BTreeMap<String, ManifestEntry>,

    /// Non-service prerequisites.
    #[serde(default)]
    pub system_dependencies: BTreeMap<String, SystemDependency>,
}

impl Manifest {
    /// Look up a known service by name, honoring bucket precedence
    /// (`core_required` over `default_optional`).
    #[must_use]
    pub fn known(&self, name: &str) -> Option<(ServiceSource, &ManifestEntry)> {
        if let Some(entry) = self.core_required.get(name) {
            return Some((ServiceSource::CoreRequired, entry));
        }
        self.default_optional
            .get(name)
            .map(|entry| (ServiceSource::DefaultOptional, entry))
    }
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The manifest file is absent.
    #[error("service manifest not found at {0}")]
    ManifestMissing(PathBuf),

    /// The manifest file cannot be parsed.
    #[error("malformed service manifest at {path}: {reason}")]
    ManifestMalformed {
        /// Path of the manifest.
        path: PathBuf,
        /// Parse failure.
        reason: String,
    },

    /// A `core_required` service has no checkout on disk.
    #[error("required core service '{0}' is not installed")]
    MissingCoreService(String),

    /// Two catalog entries claim the same port.
    #[error("port {port} is claimed by both '{first}' and '{second}'")]
    DuplicatePort {
        /// The contested port.
        port: u16,
        /// First claimant.
        first: String,
        /// Second claimant.
        second: String,
    },

    /// A service name is not a valid slug.
    #[error("invalid service name '{0}': must match ^[a-z][a-z0-9_-]*$")]
    InvalidName(String),

    /// A port is outside the valid range.
    #[error("service '{name}' has invalid port {port}")]
    InvalidPort {
        /// Offending service.
        name: String,
        /// Offending port.
        port: u32,
    },

    /// I/O failure during scan or projection writes.
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate a service-name slug.
#[must_use]
pub fn is_valid_slug(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// The reconciled catalog: every service the orchestrator knows about,
/// ordered by name.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    entries: BTreeMap<String, ServiceEntry>,
}

impl ServiceCatalog {
    /// Build a catalog from entries, validating slugs, port ranges, and
    /// port uniqueness.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn from_entries(
        entries: impl IntoIterator<Item = ServiceEntry>,
    ) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        let mut by_port: BTreeMap<u16, String> = BTreeMap::new();

        for entry in entries {
            if !is_valid_slug(&entry.name) {
                return Err(RegistryError::InvalidName(entry.name));
            }
            if entry.port == 0 {
                return Err(RegistryError::InvalidPort {
                    name: entry.name,
                    port: 0,
                });
            }
            if let Some(first) = by_port.get(&entry.port) {
                return Err(RegistryError::DuplicatePort {
                    port: entry.port,
                    first: first.clone(),
                    second: entry.name,
                });
            }
            by_port.insert(entry.port, entry.name.clone());
            map.insert(entry.name.clone(), entry);
        }

        Ok(Self { entries: map })
    }

    /// Look up one service.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ServiceEntry> {
        self.entries.get(name)
    }

    /// Whether the catalog contains a service.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Iterate over all entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.entries.values()
    }

    /// All service names in name order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Number of services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Group service names into bands sharing an `install_order` value.
    ///
    /// Bands come back in ascending order for startup; shutdown walks the
    /// result in reverse. Within a band, order is by name and carries no
    /// meaning — band members are processed concurrently.
    #[must_use]
    pub fn install_bands(&self) -> Vec<(u32, Vec<String>)> {
        let mut bands: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for entry in self.entries.values() {
            bands
                .entry(entry.install_order)
                .or_default()
                .push(entry.name.clone());
        }
        bands.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a ServiceCatalog {
    type Item = &'a ServiceEntry;
    type IntoIter = std::collections::btree_map::Values<'a, String, ServiceEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn entry(name: &str, port: u16, install_order: u32) -> ServiceEntry {
        ServiceEntry {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            source: ServiceSource::DefaultOptional,
            port,
            dependencies: BTreeSet::new(),
            install_order,
            git_url: None,
            directory_path: PathBuf::from(format!("/tmp/helm-{name}")),
            process_kind: ProcessKind::ManagedPython,
            run_entrypoint: RunEntrypoint::default(),
            visible: true,
            admin_only: false,
        }
    }

    #[test]
    fn test_slug_validation() {
        assert!(is_valid_slug("billing"));
        assert!(is_valid_slug("knowledge_tree"));
        assert!(is_valid_slug("svc-2"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("2fast"));
        assert!(!is_valid_slug("Billing"));
        assert!(!is_valid_slug("has space"));
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let err = ServiceCatalog::from_entries(vec![
            entry("alpha", 5010, 10),
            entry("beta", 5010, 11),
        ])
        .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::DuplicatePort { port: 5010, .. }
        ));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let err =
            ServiceCatalog::from_entries(vec![entry("Bad_Name", 5010, 10)]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName(_)));
    }

    #[test]
    fn test_install_bands_group_and_sort() {
        let catalog = ServiceCatalog::from_entries(vec![
            entry("x", 5001, 3),
            entry("y", 5002, 3),
            entry("z", 5003, 2),
        ])
        .unwrap();

        let bands = catalog.install_bands();
        assert_eq!(bands.len(), 2);
        assert_eq!(bands[0].0, 2);
        assert_eq!(bands[0].1, vec!["z".to_string()]);
        assert_eq!(bands[1].0, 3);
        assert_eq!(bands[1].1, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_manifest_bucket_precedence() {
        let manifest: Manifest = serde_json::from_value(serde_json::json!({
            "core_required": {
                "identity": { "display_name": "Identity", "port": 5000 }
            },
            "default_optional": {
                "identity": { "display_name": "Shadow", "port": 5999 },
                "billing": { "display_name": "Billing", "port": 5030 }
            }
        }))
        .unwrap();

        let (source, entry) = manifest.known("identity").unwrap();
        assert_eq!(source, ServiceSource::CoreRequired);
        assert_eq!(entry.port, 5000);

        let (source, _) = manifest.known("billing").unwrap();
        assert_eq!(source, ServiceSource::DefaultOptional);
        assert!(manifest.known("unknown").is_none());
    }
}
