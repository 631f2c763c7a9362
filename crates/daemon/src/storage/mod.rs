//! Storage backends
//!
//! Pluggable sinks sharing one narrow store operation. Backends are
//! constructed from a name → constructor table at startup and invoked
//! sequentially in registry order; a failing backend never prevents the
//! others from running, but any failure makes the reconcile attempt
//! retriable.
//!
//! The `signature` field carries the base64 signature for per-image
//! payloads and the serialized envelope JSON for attestation payloads;
//! `payload` is always the raw statement bytes.

pub mod annotation;
pub mod notes;
pub mod oci;
pub mod objectstore;
pub mod pubsub;

use crate::cluster::RunClient;
use crate::config::DaemonConfig;
use async_trait::async_trait;
use buildseal_common::{Error, PayloadFormat, Result, RunObject};
use std::sync::Arc;

/// One signed payload handed to every backend
#[derive(Debug, Clone)]
pub struct StorePayload {
    pub format: PayloadFormat,
    /// Raw statement bytes (before envelope wrapping).
    pub payload: Vec<u8>,
    /// Base64 signature or serialized envelope, depending on format.
    pub signature: String,
    /// Artifact identifier for per-subject formats.
    pub full_key: Option<String>,
}

/// A storage backend
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn store(&self, run: &RunObject, item: &StorePayload) -> Result<()>;
}

/// Fixed registry order; also the invocation order.
pub const BACKEND_NAMES: [&str; 5] = ["annotation", "objectstore", "oci", "notes", "pubsub"];

/// Construct the enabled backends in registry order.
pub fn build_backends(
    config: &DaemonConfig,
    client: Arc<dyn RunClient>,
) -> Result<Vec<Box<dyn Backend>>> {
    for requested in &config.enabled_backends {
        if !BACKEND_NAMES.contains(&requested.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "unknown storage backend: {requested}"
            )));
        }
    }

    let mut backends: Vec<Box<dyn Backend>> = Vec::new();
    for name in BACKEND_NAMES {
        if !config.enabled_backends.iter().any(|b| b == name) {
            continue;
        }
        let backend: Box<dyn Backend> = match name {
            "annotation" => Box::new(annotation::AnnotationBackend::new(
                client.clone(),
                config.engine.clone(),
            )),
            "objectstore" => {
                let prefix = config
                    .storage
                    .object_store
                    .as_ref()
                    .map(|c| c.prefix.clone())
                    .unwrap_or_else(|| "attestations".to_string());
                Box::new(objectstore::ObjectStoreBackend::new(
                    config.object_store_root(),
                    prefix,
                ))
            }
            "oci" => Box::new(oci::OciBackend::new(
                config.storage.oci.clone().unwrap_or_default(),
                config.reconciler.call_timeout(),
            )?),
            "notes" => {
                let notes_config = config.storage.notes.clone().ok_or_else(|| {
                    Error::InvalidConfig("notes backend enabled without configuration".into())
                })?;
                Box::new(notes::NoteDbBackend::new(
                    notes_config,
                    config.reconciler.call_timeout(),
                )?)
            }
            "pubsub" => {
                let pubsub_config = config.storage.pubsub.clone().ok_or_else(|| {
                    Error::InvalidConfig("pubsub backend enabled without configuration".into())
                })?;
                Box::new(pubsub::PubSubBackend::new(
                    pubsub_config,
                    config.reconciler.call_timeout(),
                )?)
            }
            _ => unreachable!(),
        };
        backends.push(backend);
    }
    Ok(backends)
}

pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryRunClient;

    #[test]
    fn backends_built_in_registry_order() {
        let mut config = DaemonConfig::default();
        config.store_path = std::env::temp_dir().join("buildseal-test");
        config.enabled_backends = vec!["objectstore".into(), "annotation".into()];
        let client = Arc::new(InMemoryRunClient::new());
        let backends = build_backends(&config, client).unwrap();
        let names: Vec<&str> = backends.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["annotation", "objectstore"]);
    }

    #[test]
    fn unknown_backend_rejected() {
        let mut config = DaemonConfig::default();
        config.enabled_backends = vec!["annotation".into(), "carrier-pigeon".into()];
        let client = Arc::new(InMemoryRunClient::new());
        assert!(matches!(
            build_backends(&config, client),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn misconfigured_backend_rejected() {
        let mut config = DaemonConfig::default();
        config.enabled_backends = vec!["notes".into()];
        let client = Arc::new(InMemoryRunClient::new());
        assert!(matches!(
            build_backends(&config, client),
            Err(Error::InvalidConfig(_))
        ));
    }
}
