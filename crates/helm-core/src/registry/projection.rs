//! On-disk projections of the service catalog.
//!
//! Two files are written on every reconcile:
//!
//! - `thin_registry.json` — `name -> {url, port}`, read by managed
//!   services for peer discovery;
//! - `thick_registry.json` — adds directory, entrypoint, and UI flags,
//!   read by supervisor tooling.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{RegistryError, RunEntrypoint, ServiceCatalog};
use crate::paths::HelmPaths;

/// Thin projection of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinEntry {
    /// Local URL of the service.
    pub url: String,
    /// Listening port.
    pub port: u16,
}

/// The thin registry: peer-discovery map consumed by every service.
pub type ThinRegistry = BTreeMap<String, ThinEntry>;

/// Thick projection of one service, consumed by supervisor tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThickEntry {
    /// Local URL of the service.
    pub url: String,
    /// Listening port.
    pub port: u16,
    /// Absolute checkout directory.
    pub directory_path: PathBuf,
    /// Run entrypoint.
    pub run_entrypoint: RunEntrypoint,
    /// Dashboard visibility.
    pub visible: bool,
    /// Administrator-only UI flag.
    pub admin_only: bool,
}

impl ServiceCatalog {
    /// Build the thin projection.
    #[must_use]
    pub fn thin_registry(&self) -> ThinRegistry {
        self.iter()
            .map(|e| {
                (
                    e.name.clone(),
                    ThinEntry {
                        url: e.local_url(),
                        port: e.port,
                    },
                )
            })
            .collect()
    }

    /// Build the thick projection.
    #[must_use]
    pub fn thick_registry(&self) -> BTreeMap<String, ThickEntry> {
        self.iter()
            .map(|e| {
                (
                    e.name.clone(),
                    ThickEntry {
                        url: e.local_url(),
                        port: e.port,
                        directory_path: e.directory_path.clone(),
                        run_entrypoint: e.run_entrypoint.clone(),
                        visible: e.visible,
                        admin_only: e.admin_only,
                    },
                )
            })
            .collect()
    }

    /// Write both projection files.
    ///
    /// # Errors
    ///
    /// Propagates serialization and I/O failures.
    pub fn write_projections(&self, paths: &HelmPaths) -> Result<(), RegistryError> {
        write_json(&paths.thin_registry_file(), &self.thin_registry())?;
        write_json(&paths.thick_registry_file(), &self.thick_registry())?;
        Ok(())
    }
}

/// Load the thin registry from disk.
///
/// # Errors
///
/// Returns [`RegistryError::ManifestMalformed`] when the file exists but
/// cannot be parsed; an absent file yields an empty registry.
pub fn load_thin_registry(paths: &HelmPaths) -> Result<ThinRegistry, RegistryError> {
    let path = paths.thin_registry_file();
    if !path.exists() {
        return Ok(ThinRegistry::new());
    }
    let raw = fs::read_to_string(&path)?;
    serde_json::from_str(&raw).map_err(|e| RegistryError::ManifestMalformed {
        path,
        reason: e.to_string(),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|e| {
        RegistryError::ManifestMalformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;
    fs::write(path, json + "\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::entry;
    use super::*;

    #[test]
    fn test_projections_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("helm");
        std::fs::create_dir_all(&base).unwrap();
        let paths = HelmPaths::new(&base);

        let catalog = ServiceCatalog::from_entries(vec![
            entry("billing", 5030, 50),
            entry("identity", 5000, 10),
        ])
        .unwrap();
        catalog.write_projections(&paths).unwrap();

        let thin = load_thin_registry(&paths).unwrap();
        assert_eq!(thin.len(), 2);
        assert_eq!(thin["identity"].url, "http://localhost:5000");
        assert_eq!(thin["billing"].port, 5030);

        let raw = std::fs::read_to_string(paths.thick_registry_file()).unwrap();
        let thick: BTreeMap<String, ThickEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(thick["billing"].directory_path.to_str().unwrap(), "/tmp/helm-billing");
        assert!(thick["identity"].visible);
    }

    #[test]
    fn test_absent_thin_registry_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HelmPaths::new(dir.path().join("helm"));
        assert!(load_thin_registry(&paths).unwrap().is_empty());
    }
}
