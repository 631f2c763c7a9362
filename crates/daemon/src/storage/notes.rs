//! Vulnerability-note database backend
//!
//! One occurrence per built subject, linked to a pre-existing note named
//! `<prefix>-<runkind>-intoto` for attestations or `-simplesigning` for
//! image signatures. Already-exists on the note is non-fatal; an
//! already-existing occurrence is an idempotent success.

use super::{Backend, StorePayload};
use crate::config::NoteDbConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use buildseal_common::{Error, PayloadFormat, Result, RunObject};
use serde_json::json;
use tracing::debug;

pub struct NoteDbBackend {
    client: reqwest::Client,
    config: NoteDbConfig,
}

impl NoteDbBackend {
    pub fn new(config: NoteDbConfig, timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            client: super::http_client(timeout)?,
            config,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn note_id(&self, run: &RunObject, format: PayloadFormat) -> String {
        let class = match format {
            PayloadFormat::SimpleSigning => "simplesigning",
            _ => "intoto",
        };
        format!("{}-{}-{}", self.config.note_id_prefix, run.kind(), class)
    }

    async fn ensure_note(&self, note_id: &str) -> Result<()> {
        let url = format!(
            "{}/v1/projects/{}/notes?noteId={note_id}",
            self.config.endpoint, self.config.project
        );
        let body = json!({
            "attestation": { "hint": { "human_readable_name": note_id } },
        });
        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        match response.status().as_u16() {
            200 | 201 | 409 => Ok(()),
            status => Err(Error::Storage {
                backend: "notes".into(),
                message: format!("note create returned {status}"),
            }),
        }
    }

    async fn create_occurrence(
        &self,
        note_id: &str,
        resource_uri: &str,
        item: &StorePayload,
    ) -> Result<()> {
        let url = format!(
            "{}/v1/projects/{}/occurrences",
            self.config.endpoint, self.config.project
        );
        let body = json!({
            "noteName": format!("projects/{}/notes/{note_id}", self.config.project),
            "resourceUri": resource_uri,
            "attestation": {
                "serializedPayload": BASE64.encode(&item.payload),
                "signatures": [{ "signature": item.signature }],
            },
        });
        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        match response.status().as_u16() {
            200 | 201 => Ok(()),
            // A concurrent writer already stored this occurrence.
            409 => Ok(()),
            status => Err(Error::Storage {
                backend: "notes".into(),
                message: format!("occurrence create for {resource_uri} returned {status}"),
            }),
        }
    }
}

/// Subjects named in an attestation payload, as `name@alg:hex` identifiers.
fn payload_subjects(payload: &[u8]) -> Vec<String> {
    let Ok(body) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return Vec::new();
    };
    let Some(subjects) = body["subject"].as_array() else {
        return Vec::new();
    };
    subjects
        .iter()
        .filter_map(|s| {
            let name = s["name"].as_str()?;
            let (alg, hex) = s["digest"].as_object()?.iter().next()?;
            Some(format!("{name}@{alg}:{}", hex.as_str()?))
        })
        .collect()
}

#[async_trait]
impl Backend for NoteDbBackend {
    fn name(&self) -> &'static str {
        "notes"
    }

    async fn store(&self, run: &RunObject, item: &StorePayload) -> Result<()> {
        let resource_uris = match &item.full_key {
            Some(full_key) => vec![full_key.clone()],
            None => payload_subjects(&item.payload),
        };
        if resource_uris.is_empty() {
            debug!(run = run.uid(), format = %item.format, "no subjects to record, skipping");
            return Ok(());
        }

        let note_id = self.note_id(run, item.format);
        self.ensure_note(&note_id).await?;
        for resource_uri in &resource_uris {
            self.create_occurrence(&note_id, resource_uri, item).await?;
        }
        debug!(
            run = run.uid(),
            note = %note_id,
            occurrences = resource_uris.len(),
            "stored occurrences"
        );
        Ok(())
    }
}
