//! Master configuration store.
//!
//! A single JSON document is the source of truth for host identity,
//! identity-provider settings, database administration credentials, and
//! per-service overrides. Per-service env and connection files are
//! *derived* from this document by the synthesizer; nothing else writes
//! them.
//!
//! The document is written atomically (write-temp + rename) and only ever
//! mutated explicitly: boot-time hostname detection, the identity-provider
//! bootstrap persisting the client secret, or an administrator edit.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::paths::HelmPaths;

/// Host-level system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Hostname or IP the platform is reached at. Re-detected at each boot.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Deployment environment label.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Shared secret handed to every managed service.
    #[serde(default)]
    pub secret_key: String,

    /// Log level for the orchestrator's own logger.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            environment: default_environment(),
            secret_key: random_secret(),
            log_level: default_log_level(),
        }
    }
}

/// Identity-provider connection and bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityProviderConfig {
    /// Externally reachable URL of the identity provider.
    #[serde(default = "default_idp_url")]
    pub url: String,

    /// Direct backend URL, bypassing any reverse proxy.
    #[serde(default = "default_idp_url")]
    pub backend_url: String,

    /// Realm holding the platform's clients, groups, and users.
    #[serde(default = "default_realm")]
    pub realm: String,

    /// OIDC client the platform services authenticate through.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Confidential client secret. Absent until the first bootstrap
    /// succeeds; removing it forces a full re-bootstrap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Administrator account for the identity provider's admin API.
    #[serde(default = "default_admin")]
    pub admin_username: String,

    /// Administrator password for the identity provider's admin API.
    #[serde(default = "default_admin")]
    pub admin_password: String,
}

fn default_idp_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_realm() -> String {
    "helm".to_string()
}

fn default_client_id() -> String {
    "platform-client".to_string()
}

fn default_admin() -> String {
    "admin".to_string()
}

impl Default for IdentityProviderConfig {
    fn default() -> Self {
        Self {
            url: default_idp_url(),
            backend_url: default_idp_url(),
            realm: default_realm(),
            client_id: default_client_id(),
            client_secret: None,
            admin_username: default_admin(),
            admin_password: default_admin(),
        }
    }
}

/// Relational database administration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalDbConfig {
    /// Database server host.
    #[serde(default = "default_hostname")]
    pub host: String,

    /// Database server port.
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Administrative role used to provision per-service databases.
    #[serde(default = "default_db_admin")]
    pub admin_user: String,
}

const fn default_db_port() -> u16 {
    5432
}

fn default_db_admin() -> String {
    "postgres".to_string()
}

impl Default for RelationalDbConfig {
    fn default() -> Self {
        Self {
            host: default_hostname(),
            port: default_db_port(),
            admin_user: default_db_admin(),
        }
    }
}

/// Optional graph database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDbConfig {
    /// Bolt URI of the graph database.
    pub uri: String,
    /// Graph database user.
    pub user: String,
    /// Graph database password.
    pub password: String,
}

/// Database sections of the master configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabasesConfig {
    /// Relational database (always present).
    #[serde(default)]
    pub relational: RelationalDbConfig,

    /// Graph database (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphDbConfig>,
}

/// Which database a service's connection file points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    /// The relational database.
    Relational,
    /// The graph database.
    Graph,
}

/// Per-service configuration overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Port override. The catalog port wins when this is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Which database the service uses, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_kind: Option<DatabaseKind>,

    /// Database name. Defaults to `<service>_db` when the service has a
    /// database but no explicit name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,

    /// Database role. Defaults to `<service>_user`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_user: Option<String>,

    /// Database password, stored verbatim. URL-encoding happens at
    /// synthesis time, never here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_password: Option<String>,

    /// Extra INI sections passed through to the service's conn file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_sections: BTreeMap<String, BTreeMap<String, String>>,
}

/// The master configuration document.
///
/// Exactly one exists per installation. All maps are `BTreeMap` so the
/// serialized form (and everything synthesized from it) is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Host identity and environment.
    #[serde(default)]
    pub system: SystemConfig,

    /// Identity-provider settings.
    #[serde(default)]
    pub identity_provider: IdentityProviderConfig,

    /// Database settings.
    #[serde(default)]
    pub databases: DatabasesConfig,

    /// Per-service overrides, keyed by service name.
    #[serde(default)]
    pub apps: BTreeMap<String, AppConfig>,
}

impl MasterConfig {
    /// Per-service overrides for `name`, or defaults when absent.
    #[must_use]
    pub fn app(&self, name: &str) -> AppConfig {
        self.apps.get(name).cloned().unwrap_or_default()
    }
}

/// Configuration store errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The on-disk document is not valid JSON or violates the schema.
    /// Startup must halt; the administrator has to repair the file.
    #[error("malformed master config at {path}: {reason}")]
    Malformed {
        /// Path of the offending file.
        path: PathBuf,
        /// Parse or validation failure.
        reason: String,
    },

    /// A patch attempted to delete a protected section.
    #[error("refusing to delete protected section '{0}'")]
    ProtectedSection(String),

    /// I/O failure reading or writing the document.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent store for the master configuration document.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store for the installation rooted at `paths`.
    #[must_use]
    pub fn new(paths: &HelmPaths) -> Self {
        Self {
            path: paths.master_config_file(),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the master configuration.
    ///
    /// An absent file yields the defaults, which are immediately persisted
    /// so the installation always has exactly one document on disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Malformed`] when the file exists but cannot
    /// be parsed. This is fatal to orchestrator startup; the file is never
    /// silently replaced.
    pub fn load(&self) -> Result<MasterConfig, ConfigError> {
        if !self.path.exists() {
            let cfg = MasterConfig {
                system: SystemConfig::default(),
                ..MasterConfig::default()
            };
            self.save(&cfg)?;
            return Ok(cfg);
        }

        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Atomically replace the document on disk.
    ///
    /// # Errors
    ///
    /// Returns an error when the document cannot be serialized or the
    /// temp-write/rename fails.
    pub fn save(&self, cfg: &MasterConfig) -> Result<(), ConfigError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| ConfigError::Malformed {
                path: self.path.clone(),
                reason: "config path has no parent directory".to_string(),
            })?;
        fs::create_dir_all(parent)?;

        let json = serde_json::to_string_pretty(cfg).map_err(|e| ConfigError::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        // Temp file in the same directory so the rename stays on one
        // filesystem.
        let tmp = parent.join(".master_config.json.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(json.as_bytes())?;
            f.write_all(b"\n")?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Deep-merge a JSON patch into the document and persist the result.
    ///
    /// Object values merge recursively; scalar and array values replace.
    /// A `null` removes the key, except for the protected `system` and
    /// `identity_provider` sections.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ProtectedSection`] when the patch nulls a
    /// protected section, or [`ConfigError::Malformed`] when the merged
    /// document no longer fits the schema.
    pub fn update(&self, patch: &serde_json::Value) -> Result<MasterConfig, ConfigError> {
        if let Some(obj) = patch.as_object() {
            for protected in ["system", "identity_provider"] {
                if obj.get(protected).is_some_and(serde_json::Value::is_null) {
                    return Err(ConfigError::ProtectedSection(protected.to_string()));
                }
            }
        }

        let current = self.load()?;
        let mut doc = serde_json::to_value(&current).map_err(|e| ConfigError::Malformed {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        deep_merge(&mut doc, patch);

        let merged: MasterConfig =
            serde_json::from_value(doc).map_err(|e| ConfigError::Malformed {
                path: self.path.clone(),
                reason: format!("patch produced invalid config: {e}"),
            })?;
        self.save(&merged)?;
        Ok(merged)
    }

    /// Remove the persisted client secret, forcing a full identity-provider
    /// re-bootstrap on the next boot.
    ///
    /// # Errors
    ///
    /// Propagates load/save failures.
    pub fn clear_identity_provider(&self) -> Result<MasterConfig, ConfigError> {
        let mut cfg = self.load()?;
        cfg.identity_provider.client_secret = None;
        self.save(&cfg)?;
        Ok(cfg)
    }
}

/// Recursive JSON merge: objects merge per-key, `null` deletes, anything
/// else replaces.
fn deep_merge(doc: &mut serde_json::Value, patch: &serde_json::Value) {
    match (doc, patch) {
        (serde_json::Value::Object(doc_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    doc_map.remove(key);
                } else if let Some(existing) = doc_map.get_mut(key) {
                    deep_merge(existing, value);
                } else {
                    doc_map.insert(key.clone(), value.clone());
                }
            }
        }
        (doc, patch) => *doc = patch.clone(),
    }
}

/// Generate a fresh random secret key (48 hex characters).
fn random_secret() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Detect the current hostname.
///
/// Falls back to `localhost` when the hostname cannot be read or is not
/// valid UTF-8.
#[must_use]
pub fn detect_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(default_hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::new(&HelmPaths::new(dir.path()))
    }

    #[test]
    fn test_load_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let cfg = store.load().unwrap();

        assert_eq!(cfg.system.hostname, "localhost");
        assert_eq!(cfg.identity_provider.realm, "helm");
        assert!(cfg.identity_provider.client_secret.is_none());
        assert_eq!(cfg.system.secret_key.len(), 48);
        assert!(store.path().exists());
    }

    #[test]
    fn test_load_round_trips_saved_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut cfg = store.load().unwrap();
        cfg.system.hostname = "10.0.0.5".to_string();
        cfg.identity_provider.client_secret = Some("s3cr3t".to_string());
        cfg.apps.insert(
            "billing".to_string(),
            AppConfig {
                database_kind: Some(DatabaseKind::Relational),
                db_name: Some("billing_db".to_string()),
                ..AppConfig::default()
            },
        );
        store.save(&cfg).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.system.hostname, "10.0.0.5");
        assert_eq!(
            reloaded.identity_provider.client_secret.as_deref(),
            Some("s3cr3t")
        );
        assert_eq!(
            reloaded.apps["billing"].db_name.as_deref(),
            Some("billing_db")
        );
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn test_update_deep_merges() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.load().unwrap();

        let merged = store
            .update(&serde_json::json!({
                "system": { "hostname": "10.0.0.9" },
                "apps": { "billing": { "port": 5030 } }
            }))
            .unwrap();

        assert_eq!(merged.system.hostname, "10.0.0.9");
        // Untouched siblings survive the merge.
        assert_eq!(merged.system.log_level, "INFO");
        assert_eq!(merged.apps["billing"].port, Some(5030));
    }

    #[test]
    fn test_update_rejects_deleting_protected_sections() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.load().unwrap();

        let err = store
            .update(&serde_json::json!({ "identity_provider": null }))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ProtectedSection(s) if s == "identity_provider"));
    }

    #[test]
    fn test_clear_identity_provider_drops_only_the_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut cfg = store.load().unwrap();
        cfg.identity_provider.client_secret = Some("abc".to_string());
        store.save(&cfg).unwrap();

        let cleared = store.clear_identity_provider().unwrap();
        assert!(cleared.identity_provider.client_secret.is_none());
        assert_eq!(cleared.identity_provider.realm, "helm");
        assert_eq!(cleared.identity_provider.admin_username, "admin");
    }
}
