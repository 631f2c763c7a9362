//! Pub/sub backend: one message per signed envelope
//!
//! The message body carries the signature; consumers that need the
//! payload fetch it from one of the payload-carrying backends.

use super::{Backend, StorePayload};
use crate::config::PubSubConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use buildseal_common::{Error, Result, RunObject};
use serde_json::json;
use tracing::debug;

pub struct PubSubBackend {
    client: reqwest::Client,
    config: PubSubConfig,
}

impl PubSubBackend {
    pub fn new(config: PubSubConfig, timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            client: super::http_client(timeout)?,
            config,
        })
    }
}

#[async_trait]
impl Backend for PubSubBackend {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    async fn store(&self, run: &RunObject, item: &StorePayload) -> Result<()> {
        let url = format!(
            "{}/v1/topics/{}:publish",
            self.config.endpoint, self.config.topic
        );
        let body = json!({
            "messages": [{
                "data": BASE64.encode(item.signature.as_bytes()),
                "attributes": {
                    "run": run.uid(),
                    "format": item.format.as_str(),
                },
            }],
        });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Storage {
                backend: "pubsub".into(),
                message: format!("publish to {} returned {}", self.config.topic, response.status()),
            });
        }
        debug!(run = run.uid(), topic = %self.config.topic, "published signature");
        Ok(())
    }
}
