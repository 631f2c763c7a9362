//! Timestamp authority client
//!
//! Submits a signature for counter-signing and returns the authority's
//! token, which the signer embeds as a secondary envelope signature.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use buildseal_common::{Error, Result, TimestampAuthority};
use serde::Deserialize;
use tracing::debug;

pub struct HttpTimestampAuthority {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct TimestampResponse {
    token: String,
}

impl HttpTimestampAuthority {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TimestampAuthority for HttpTimestampAuthority {
    async fn countersign(&self, signature: &[u8]) -> Result<Vec<u8>> {
        let body = serde_json::json!({ "signature": BASE64.encode(signature) });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Signing(format!(
                "timestamp authority returned {}",
                response.status()
            )));
        }
        let parsed: TimestampResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let token = BASE64
            .decode(parsed.token)
            .map_err(|e| Error::Signing(format!("timestamp token is not base64: {e}")))?;
        debug!(url = %self.url, "obtained timestamp token");
        Ok(token)
    }
}
