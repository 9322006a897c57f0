//! Filesystem layout of a Helm installation.
//!
//! Every path the orchestrator reads or writes is derived from a single
//! base directory, so tests can point the whole system at a temp dir.
//!
//! Layout relative to the base directory:
//!
//! ```text
//! <base>/
//!   services_manifest.json       static service manifest
//!   thin_registry.json           name -> {url, port}        (written)
//!   thick_registry.json          supervisor projection      (written)
//!   instance/
//!     configs/master_config.json master configuration       (written)
//!     helm.db                    log/metric store           (written)
//!   pids/<name>.pid              one pidfile per service    (written)
//!   logs/<name>.stdout.log       captured stdout            (written)
//!   logs/<name>.stderr.log       captured stderr            (written)
//! <base>/../<prefix><name>/      sibling service directories
//! ```

use std::path::{Path, PathBuf};

/// Directory prefix shared by all sibling service checkouts.
pub const SERVICE_DIR_PREFIX: &str = "helm-";

/// Resolved filesystem layout for one Helm installation.
#[derive(Debug, Clone)]
pub struct HelmPaths {
    base_dir: PathBuf,
}

impl HelmPaths {
    /// Create a layout rooted at the given orchestrator directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The orchestrator's own directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Parent directory holding the sibling service checkouts.
    #[must_use]
    pub fn parent_dir(&self) -> PathBuf {
        self.base_dir
            .parent()
            .map_or_else(|| self.base_dir.clone(), Path::to_path_buf)
    }

    /// Directory of one service, `<parent>/<prefix><name>`.
    #[must_use]
    pub fn service_dir(&self, name: &str) -> PathBuf {
        self.parent_dir().join(format!("{SERVICE_DIR_PREFIX}{name}"))
    }

    /// `instance/` directory for orchestrator-private state.
    #[must_use]
    pub fn instance_dir(&self) -> PathBuf {
        self.base_dir.join("instance")
    }

    /// Path of the master configuration document.
    #[must_use]
    pub fn master_config_file(&self) -> PathBuf {
        self.instance_dir().join("configs").join("master_config.json")
    }

    /// Path of the log/metric store database.
    #[must_use]
    pub fn store_file(&self) -> PathBuf {
        self.instance_dir().join("helm.db")
    }

    /// Path of the static service manifest.
    #[must_use]
    pub fn manifest_file(&self) -> PathBuf {
        self.base_dir.join("services_manifest.json")
    }

    /// Path of the thin registry projection.
    #[must_use]
    pub fn thin_registry_file(&self) -> PathBuf {
        self.base_dir.join("thin_registry.json")
    }

    /// Path of the thick registry projection.
    #[must_use]
    pub fn thick_registry_file(&self) -> PathBuf {
        self.base_dir.join("thick_registry.json")
    }

    /// Directory holding one pidfile per service.
    #[must_use]
    pub fn pids_dir(&self) -> PathBuf {
        self.base_dir.join("pids")
    }

    /// Pidfile for one service.
    #[must_use]
    pub fn pidfile(&self, name: &str) -> PathBuf {
        self.pids_dir().join(format!("{name}.pid"))
    }

    /// Directory holding captured process output.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Captured-stdout file for one service.
    #[must_use]
    pub fn stdout_log(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{name}.stdout.log"))
    }

    /// Captured-stderr file for one service.
    #[must_use]
    pub fn stderr_log(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{name}.stderr.log"))
    }
}
