//! Filesystem discovery and catalog reconciliation.
//!
//! The scanner walks the parent directory for entries named
//! `<prefix><name>` that contain a runnable entrypoint. Discovered names
//! that appear in the manifest are promoted to the manifest entry
//! verbatim; unknown names get a synthesized `discovered` entry with a
//! deterministic port.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use super::{
    Manifest, ProcessKind, RegistryError, RunEntrypoint, ServiceCatalog, ServiceEntry,
    ServiceSource, SystemDependencyKind, is_valid_slug,
};
use crate::paths::{HelmPaths, SERVICE_DIR_PREFIX};

/// Install order assigned to discovered (manifest-less) services.
const DISCOVERED_INSTALL_ORDER: u32 = 99;

/// Port window for discovered services: `5000 + hash % 900`.
const DISCOVERED_PORT_BASE: u16 = 5000;
const DISCOVERED_PORT_SPAN: u64 = 900;

/// Registry built from the manifest plus a filesystem scan.
#[derive(Debug)]
pub struct ServiceRegistry {
    paths: HelmPaths,
    manifest: Manifest,
}

impl ServiceRegistry {
    /// Load the registry for the installation rooted at `paths`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ManifestMissing`] when the manifest file
    /// is absent and [`RegistryError::ManifestMalformed`] when it cannot
    /// be parsed.
    pub fn load(paths: &HelmPaths) -> Result<Self, RegistryError> {
        let manifest_path = paths.manifest_file();
        if !manifest_path.exists() {
            return Err(RegistryError::ManifestMissing(manifest_path));
        }

        let raw = fs::read_to_string(&manifest_path)?;
        let manifest =
            serde_json::from_str(&raw).map_err(|e| RegistryError::ManifestMalformed {
                path: manifest_path,
                reason: e.to_string(),
            })?;

        Ok(Self {
            paths: paths.clone(),
            manifest,
        })
    }

    /// Build a registry from an in-memory manifest (used by tests and by
    /// installers that have not written the manifest yet).
    #[must_use]
    pub fn from_manifest(paths: &HelmPaths, manifest: Manifest) -> Self {
        Self {
            paths: paths.clone(),
            manifest,
        }
    }

    /// The loaded manifest.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Scan the parent directory for installed services.
    ///
    /// A directory qualifies when its name starts with the platform prefix
    /// and it contains a runnable entrypoint (`run.py` for managed
    /// services). The returned names are sorted.
    #[must_use]
    pub fn discover(&self) -> Vec<String> {
        let parent = self.paths.parent_dir();
        let Ok(read_dir) = fs::read_dir(&parent) else {
            warn!(dir = %parent.display(), "cannot scan parent directory");
            return Vec::new();
        };

        let mut names: Vec<String> = read_dir
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let dir_name = e.file_name().into_string().ok()?;
                let name = dir_name.strip_prefix(SERVICE_DIR_PREFIX)?.to_string();
                if !is_valid_slug(&name) {
                    debug!(dir = %dir_name, "skipping non-slug directory");
                    return None;
                }
                if !has_entrypoint(&e.path(), &self.manifest, &name) {
                    debug!(dir = %dir_name, "skipping directory without entrypoint");
                    return None;
                }
                Some(name)
            })
            .collect();

        names.sort();
        names
    }

    /// Reconcile the manifest with the filesystem into the final catalog.
    ///
    /// Discovered names present in the manifest take the manifest entry
    /// verbatim (promotion); unknown names get a synthesized `discovered`
    /// entry. The identity provider is added as an `external_java` entry
    /// when its installation directory exists. Every `core_required`
    /// service must be present on disk.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::MissingCoreService`] for an absent
    /// required service, or any catalog validation failure.
    pub fn reconcile(&self) -> Result<ServiceCatalog, RegistryError> {
        let discovered = self.discover();
        let mut entries = Vec::new();

        for name in &discovered {
            let directory_path = self.paths.service_dir(name);
            let entry = match self.manifest.known(name) {
                Some((source, manifest_entry)) => ServiceEntry {
                    name: name.clone(),
                    display_name: manifest_entry.display_name.clone(),
                    description: manifest_entry.description.clone(),
                    source,
                    port: manifest_entry.port,
                    dependencies: manifest_entry.dependencies.clone(),
                    install_order: manifest_entry.install_order,
                    git_url: manifest_entry.git_url.clone(),
                    directory_path,
                    process_kind: manifest_entry.process_kind,
                    run_entrypoint: manifest_entry.run_entrypoint.clone(),
                    visible: manifest_entry.visible,
                    admin_only: manifest_entry.admin_only,
                },
                None => {
                    let port = discovered_port(name);
                    info!(service = %name, port, "registering discovered service");
                    ServiceEntry {
                        name: name.clone(),
                        display_name: title_case(name),
                        description: "Discovered service".to_string(),
                        source: ServiceSource::Discovered,
                        port,
                        dependencies: std::collections::BTreeSet::new(),
                        install_order: DISCOVERED_INSTALL_ORDER,
                        git_url: None,
                        directory_path,
                        process_kind: ProcessKind::ManagedPython,
                        run_entrypoint: RunEntrypoint::default(),
                        visible: true,
                        admin_only: false,
                    }
                }
            };
            entries.push(entry);
        }

        // The identity provider is not a peer service checkout; it joins
        // the catalog when its installation directory exists.
        for (name, dep) in &self.manifest.system_dependencies {
            if dep.kind != SystemDependencyKind::IdentityProvider {
                continue;
            }
            let (Some(directory), Some(port), Some(start_command)) =
                (&dep.directory, dep.port, &dep.start_command)
            else {
                continue;
            };
            let directory_path = self.paths.parent_dir().join(directory);
            if !directory_path.is_dir() {
                debug!(dependency = %name, "identity provider not installed yet");
                continue;
            }
            entries.push(ServiceEntry {
                name: name.clone(),
                display_name: title_case(name),
                description: dep.description.clone(),
                source: ServiceSource::CoreRequired,
                port,
                dependencies: std::collections::BTreeSet::new(),
                install_order: 0,
                git_url: None,
                directory_path,
                process_kind: ProcessKind::ExternalJava,
                run_entrypoint: RunEntrypoint::Command {
                    command: start_command.clone(),
                },
                visible: false,
                admin_only: true,
            });
        }

        for name in self.manifest.core_required.keys() {
            if !discovered.contains(name) {
                return Err(RegistryError::MissingCoreService(name.clone()));
            }
        }

        ServiceCatalog::from_entries(entries)
    }
}

/// Whether a candidate directory contains a runnable entrypoint.
fn has_entrypoint(dir: &Path, manifest: &Manifest, name: &str) -> bool {
    let entrypoint = manifest
        .known(name)
        .map_or_else(RunEntrypoint::default, |(_, e)| e.run_entrypoint.clone());

    match entrypoint {
        RunEntrypoint::Python { script, .. } => dir.join(script).is_file(),
        RunEntrypoint::Command { command } => command
            .split_whitespace()
            .next()
            .is_some_and(|exe| dir.join(exe).is_file()),
    }
}

/// Deterministic port for a discovered service: `5000 + fnv1a(name) % 900`.
///
/// FNV-1a rather than the stdlib hasher: the assignment must be stable
/// across runs, platforms, and compiler versions.
#[must_use]
pub fn discovered_port(name: &str) -> u16 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    #[allow(clippy::cast_possible_truncation)]
    let offset = (hash % DISCOVERED_PORT_SPAN) as u16;
    DISCOVERED_PORT_BASE + offset
}

/// `knowledge_tree` -> `Knowledge Tree`.
fn title_case(name: &str) -> String {
    name.split(['_', '-'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().collect::<String>() + chars.as_str()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::registry::ManifestEntry;

    fn manifest_with(names: &[(&str, u16, bool)]) -> Manifest {
        let mut manifest = Manifest::default();
        for (name, port, required) in names {
            let entry = ManifestEntry {
                display_name: title_case(name),
                description: String::new(),
                port: *port,
                dependencies: std::collections::BTreeSet::new(),
                install_order: if *required { 10 } else { 50 },
                git_url: None,
                process_kind: ProcessKind::ManagedPython,
                run_entrypoint: RunEntrypoint::default(),
                visible: true,
                admin_only: false,
            };
            if *required {
                manifest.core_required.insert((*name).to_string(), entry);
            } else {
                manifest.default_optional.insert((*name).to_string(), entry);
            }
        }
        manifest
    }

    fn install_service(parent: &Path, name: &str) {
        let dir = parent.join(format!("{SERVICE_DIR_PREFIX}{name}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("run.py"), "print('ok')\n").unwrap();
    }

    fn sandbox() -> (tempfile::TempDir, HelmPaths) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("helm");
        fs::create_dir_all(&base).unwrap();
        let paths = HelmPaths::new(&base);
        (dir, paths)
    }

    #[test]
    fn test_discover_strips_prefix_and_requires_entrypoint() {
        let (dir, paths) = sandbox();
        install_service(dir.path(), "billing");
        install_service(dir.path(), "tickets");
        // Directory without an entrypoint is skipped.
        fs::create_dir_all(dir.path().join("helm-empty")).unwrap();
        // Non-prefixed directory is skipped.
        fs::create_dir_all(dir.path().join("unrelated")).unwrap();

        let registry = ServiceRegistry::from_manifest(&paths, Manifest::default());
        assert_eq!(registry.discover(), vec!["billing", "tickets"]);
    }

    #[test]
    fn test_promotion_takes_manifest_entry_verbatim() {
        let (dir, paths) = sandbox();
        install_service(dir.path(), "billing");

        let manifest = manifest_with(&[("billing", 5030, false)]);
        let registry = ServiceRegistry::from_manifest(&paths, manifest);
        let catalog = registry.reconcile().unwrap();

        let entry = catalog.get("billing").unwrap();
        assert_eq!(entry.source, ServiceSource::DefaultOptional);
        assert_eq!(entry.port, 5030);
        assert_eq!(entry.install_order, 50);
    }

    #[test]
    fn test_unknown_service_gets_deterministic_discovered_entry() {
        let (dir, paths) = sandbox();
        install_service(dir.path(), "sidecar");

        let registry = ServiceRegistry::from_manifest(&paths, Manifest::default());
        let catalog = registry.reconcile().unwrap();

        let entry = catalog.get("sidecar").unwrap();
        assert_eq!(entry.source, ServiceSource::Discovered);
        assert_eq!(entry.install_order, 99);
        assert!(entry.visible);
        assert!(entry.dependencies.is_empty());
        assert_eq!(entry.port, discovered_port("sidecar"));
        assert!((5000..5900).contains(&entry.port));
        // Stable across calls.
        assert_eq!(discovered_port("sidecar"), discovered_port("sidecar"));
        assert_ne!(discovered_port("sidecar"), discovered_port("sidecab"));
    }

    #[test]
    fn test_missing_core_service_is_fatal() {
        let (_dir, paths) = sandbox();

        let manifest = manifest_with(&[("identity", 5000, true)]);
        let registry = ServiceRegistry::from_manifest(&paths, manifest);

        let err = registry.reconcile().unwrap_err();
        assert!(matches!(err, RegistryError::MissingCoreService(n) if n == "identity"));
    }

    #[test]
    fn test_identity_provider_joins_catalog_when_installed() {
        let (dir, paths) = sandbox();
        let mut manifest = Manifest::default();
        manifest.system_dependencies.insert(
            "idp".to_string(),
            super::super::SystemDependency {
                kind: SystemDependencyKind::IdentityProvider,
                description: "OIDC server".to_string(),
                directory: Some("oidc-server-26.0".to_string()),
                port: Some(8080),
                start_command: Some("bin/server.sh start-dev".to_string()),
            },
        );

        // Not installed yet: absent from the catalog.
        let registry = ServiceRegistry::from_manifest(&paths, manifest.clone());
        assert!(!registry.reconcile().unwrap().contains("idp"));

        // Installed: joins as an external_java entry in band 0.
        fs::create_dir_all(dir.path().join("oidc-server-26.0")).unwrap();
        let registry = ServiceRegistry::from_manifest(&paths, manifest);
        let catalog = registry.reconcile().unwrap();
        let idp = catalog.get("idp").unwrap();
        assert_eq!(idp.process_kind, ProcessKind::ExternalJava);
        assert_eq!(idp.install_order, 0);
        assert_eq!(idp.port, 8080);
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("billing"), "Billing");
        assert_eq!(title_case("knowledge_tree"), "Knowledge Tree");
    }
}
