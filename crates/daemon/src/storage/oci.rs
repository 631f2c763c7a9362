//! OCI registry backend
//!
//! Attaches a signature manifest adjacent to the referenced image, tagged
//! `sha256-<hex>.sig`. The payload becomes the single layer blob, the
//! signature rides in the layer annotations. Only per-subject payloads
//! carry an image reference; attestation payloads without one are skipped.

use super::{Backend, StorePayload};
use crate::config::OciConfig;
use async_trait::async_trait;
use buildseal_common::uri::ImageId;
use buildseal_common::{Error, Result, RunObject};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";

pub struct OciBackend {
    client: reqwest::Client,
    config: OciConfig,
}

impl OciBackend {
    pub fn new(config: OciConfig, timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            client: super::http_client(timeout)?,
            config,
        })
    }

    fn scheme(&self) -> &'static str {
        if self.config.insecure {
            "http"
        } else {
            "https"
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Monolithic blob upload; already-present blobs are accepted.
    async fn push_blob(&self, registry: &str, repo: &str, data: &[u8]) -> Result<String> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        let url = format!(
            "{}://{registry}/v2/{repo}/blobs/uploads/?digest={digest}",
            self.scheme()
        );
        let response = self
            .authorize(self.client.post(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        match response.status().as_u16() {
            201 | 202 => Ok(digest),
            status => Err(Error::Storage {
                backend: "oci".into(),
                message: format!("blob upload to {repo} returned {status}"),
            }),
        }
    }

    async fn push_manifest(
        &self,
        registry: &str,
        repo: &str,
        tag: &str,
        manifest: &serde_json::Value,
    ) -> Result<()> {
        let url = format!("{}://{registry}/v2/{repo}/manifests/{tag}", self.scheme());
        let response = self
            .authorize(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, MEDIA_TYPE_MANIFEST)
            .json(manifest)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Storage {
                backend: "oci".into(),
                message: format!("manifest put to {repo}:{tag} returned {}", response.status()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for OciBackend {
    fn name(&self) -> &'static str {
        "oci"
    }

    async fn store(&self, run: &RunObject, item: &StorePayload) -> Result<()> {
        let Some(full_key) = &item.full_key else {
            debug!(run = run.uid(), format = %item.format, "payload has no image reference, skipping");
            return Ok(());
        };
        let image = match ImageId::parse(full_key) {
            Ok(image) => image,
            Err(e) => {
                warn!(run = run.uid(), full_key, "not an image reference: {}", e);
                return Ok(());
            }
        };
        let Some((registry, repo)) = image.repository.split_once('/') else {
            warn!(run = run.uid(), full_key, "image reference without registry, skipping");
            return Ok(());
        };
        let tag = format!("{}-{}.sig", image.algorithm, image.hex);

        let config_bytes = b"{}".to_vec();
        let config_digest = self.push_blob(registry, repo, &config_bytes).await?;
        let layer_digest = self.push_blob(registry, repo, &item.payload).await?;

        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST,
            "config": {
                "mediaType": MEDIA_TYPE_CONFIG,
                "digest": config_digest,
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": item.format.payload_type(),
                "digest": layer_digest,
                "size": item.payload.len(),
                "annotations": { SIGNATURE_ANNOTATION: item.signature },
            }],
        });
        self.push_manifest(registry, repo, &tag, &manifest).await?;
        debug!(run = run.uid(), reference = %format!("{registry}/{repo}:{tag}"), "attached signature manifest");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildseal_common::types::TaskRun;
    use buildseal_common::PayloadFormat;

    #[tokio::test]
    async fn attestation_without_reference_is_skipped() {
        let backend = OciBackend::new(OciConfig::default(), std::time::Duration::from_secs(1))
            .unwrap();
        let run = RunObject::Task(TaskRun::default());
        let item = StorePayload {
            format: PayloadFormat::SlsaV10,
            payload: b"{}".to_vec(),
            signature: "env".into(),
            full_key: None,
        };
        // No image reference means nothing to attach; no network touched.
        backend.store(&run, &item).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_reference_is_skipped() {
        let backend = OciBackend::new(OciConfig::default(), std::time::Duration::from_secs(1))
            .unwrap();
        let run = RunObject::Task(TaskRun::default());
        let item = StorePayload {
            format: PayloadFormat::SimpleSigning,
            payload: b"{}".to_vec(),
            signature: "sig".into(),
            full_key: Some("no-digest-here".into()),
        };
        backend.store(&run, &item).await.unwrap();
    }
}
