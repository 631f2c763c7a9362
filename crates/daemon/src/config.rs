//! Daemon configuration

use buildseal_common::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Store directory path
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Backends enabled, in invocation order.
    #[serde(default = "default_backends")]
    pub enabled_backends: Vec<String>,

    /// Path to the PKCS#8 signing key; generated on first run when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key_path: Option<PathBuf>,

    /// Payload-shaping settings shared by every worker.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Orchestrator endpoint configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Reconciler tuning
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Per-backend endpoint configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_backends() -> Vec<String> {
    vec!["annotation".to_string()]
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            enabled_backends: default_backends(),
            signing_key_path: None,
            engine: EngineConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            reconciler: ReconcilerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Orchestrator endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Base URL of the run read/patch API
    pub endpoint: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
        }
    }
}

/// Reconciler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Parallel reconcile workers
    pub workers: usize,

    /// Bounded retry attempts per run before giving up
    pub max_attempts: u32,

    /// Deadline for a single reconcile pass, seconds
    pub reconcile_timeout_secs: u64,

    /// Deadline for each external call, seconds
    pub call_timeout_secs: u64,

    /// Interval between full resyncs of known runs, seconds
    pub resync_interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            reconcile_timeout_secs: 300,
            call_timeout_secs: 30,
            resync_interval_secs: 300,
        }
    }
}

impl ReconcilerConfig {
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

/// Per-backend endpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_store: Option<ObjectStoreConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<NoteDbConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubsub: Option<PubSubConfig>,
}

/// Blob store rooted at a directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Root directory; defaults to `<store_path>/attestations`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Object name prefix
    #[serde(default = "default_object_prefix")]
    pub prefix: String,
}

fn default_object_prefix() -> String {
    "attestations".to_string()
}

/// OCI registry signature storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciConfig {
    /// Bearer token for registry auth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Use plain HTTP instead of HTTPS
    #[serde(default)]
    pub insecure: bool,
}

/// Vulnerability-note database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteDbConfig {
    pub endpoint: String,
    pub project: String,
    /// Note id prefix; the full id appends the run kind and payload class.
    #[serde(default = "default_note_prefix")]
    pub note_id_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_note_prefix() -> String {
    "buildseal".to_string()
}

/// Pub/sub topic publishing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    pub endpoint: String,
    pub topic: String,
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the signing key path
    pub fn signing_key_path(&self) -> PathBuf {
        self.signing_key_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("signing.key"))
    }

    /// Get the object-store root
    pub fn object_store_root(&self) -> PathBuf {
        self.storage
            .object_store
            .as_ref()
            .and_then(|c| c.root.clone())
            .unwrap_or_else(|| self.store_path.join("attestations"))
    }
}

/// Default store path
pub fn default_store_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".buildseal")
}
