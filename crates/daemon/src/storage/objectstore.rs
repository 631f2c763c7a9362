//! Object-store backend: attestation blobs on a directory root
//!
//! Two blobs per artifact, `<prefix>/<key>.<format>.payload` and
//! `.signature`. Object names are derived deterministically from the
//! artifact identifier so that re-signing overwrites instead of
//! accumulating. Writes go through a temp file and rename.

use super::{Backend, StorePayload};
use async_trait::async_trait;
use buildseal_common::{Result, RunObject};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub struct ObjectStoreBackend {
    root: PathBuf,
    prefix: String,
}

impl ObjectStoreBackend {
    pub fn new(root: PathBuf, prefix: String) -> Self {
        Self { root, prefix }
    }

    /// Stable object name for an artifact identifier.
    fn object_name(run: &RunObject, item: &StorePayload) -> String {
        let key = match &item.full_key {
            Some(full_key) => full_key.clone(),
            None => format!("{}-{}-{}", run.kind(), run.namespace(), run.name()),
        };
        sanitize(&key)
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Keep object names filesystem- and URL-safe.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "objectstore"
    }

    async fn store(&self, run: &RunObject, item: &StorePayload) -> Result<()> {
        let name = Self::object_name(run, item);
        let base = self.root.join(&self.prefix);
        let payload_path = base.join(format!("{name}.{}.payload", item.format));
        let signature_path = base.join(format!("{name}.{}.signature", item.format));

        self.write_atomic(&payload_path, &item.payload).await?;
        self.write_atomic(&signature_path, item.signature.as_bytes())
            .await?;
        debug!(run = run.uid(), object = %name, "stored payload blobs");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildseal_common::types::{ObjectMeta, TaskRun};
    use buildseal_common::PayloadFormat;
    use tempfile::TempDir;

    fn run() -> RunObject {
        RunObject::Task(TaskRun {
            meta: ObjectMeta {
                name: "build".into(),
                namespace: "builds".into(),
                uid: "uid-1".into(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn writes_payload_and_signature_blobs() {
        let tmp = TempDir::new().unwrap();
        let backend = ObjectStoreBackend::new(tmp.path().to_path_buf(), "att".into());
        let item = StorePayload {
            format: PayloadFormat::SlsaV10,
            payload: b"{\"x\":1}".to_vec(),
            signature: "envelope-json".into(),
            full_key: Some("reg/img@sha256:abcd".into()),
        };
        backend.store(&run(), &item).await.unwrap();

        let payload_path = tmp
            .path()
            .join("att")
            .join("reg-img-sha256-abcd.slsa-1.0.payload");
        assert_eq!(fs::read(&payload_path).await.unwrap(), item.payload);
        let signature_path = tmp
            .path()
            .join("att")
            .join("reg-img-sha256-abcd.slsa-1.0.signature");
        assert_eq!(
            fs::read(&signature_path).await.unwrap(),
            b"envelope-json".to_vec()
        );
    }

    #[tokio::test]
    async fn rewrite_overwrites_same_object() {
        let tmp = TempDir::new().unwrap();
        let backend = ObjectStoreBackend::new(tmp.path().to_path_buf(), "att".into());
        let mut item = StorePayload {
            format: PayloadFormat::SlsaV02,
            payload: b"first".to_vec(),
            signature: "s1".into(),
            full_key: None,
        };
        backend.store(&run(), &item).await.unwrap();
        item.payload = b"second".to_vec();
        backend.store(&run(), &item).await.unwrap();

        let dir = tmp.path().join("att");
        let mut entries = fs::read_dir(&dir).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2, "payload and signature, no accumulation");

        let payload_path = dir.join("taskrun-builds-build.slsa-0.2.payload");
        assert_eq!(fs::read(&payload_path).await.unwrap(), b"second".to_vec());
    }
}
