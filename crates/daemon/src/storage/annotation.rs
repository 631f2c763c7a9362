//! Annotation storage: payloads patched onto the run object itself

use super::{Backend, StorePayload};
use crate::cluster::{RunClient, RunKey};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use buildseal_common::{EngineConfig, Result, RunObject};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Stores each payload and signature as annotations under the configured
/// prefix, using the orchestrator's merge-patch so concurrent writers
/// cannot lose each other's keys.
pub struct AnnotationBackend {
    client: Arc<dyn RunClient>,
    engine: EngineConfig,
}

impl AnnotationBackend {
    pub fn new(client: Arc<dyn RunClient>, engine: EngineConfig) -> Self {
        Self { client, engine }
    }
}

#[async_trait]
impl Backend for AnnotationBackend {
    fn name(&self) -> &'static str {
        "annotation"
    }

    async fn store(&self, run: &RunObject, item: &StorePayload) -> Result<()> {
        let annotations = BTreeMap::from([
            (
                self.engine.payload_annotation(item.format),
                BASE64.encode(&item.payload),
            ),
            (
                self.engine.signature_annotation(item.format),
                item.signature.clone(),
            ),
        ]);
        self.client
            .patch_annotations(&RunKey::for_run(run), annotations)
            .await?;
        debug!(run = run.uid(), format = %item.format, "stored payload as annotations");
        Ok(())
    }
}
