//! Simple image signature payloads
//!
//! One payload per OCI subject, binding the image reference to its
//! manifest digest.

use super::{Payload, RunView};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct SigPayload {
    pub critical: Critical,
    pub optional: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct Critical {
    pub identity: Identity,
    pub image: Image,
    #[serde(rename = "type")]
    pub type_name: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Identity {
    #[serde(rename = "docker-reference")]
    pub docker_reference: String,
}

#[derive(Debug, Serialize)]
pub struct Image {
    #[serde(rename = "Docker-manifest-digest")]
    pub docker_manifest_digest: String,
}

/// Generate one signature payload per OCI subject. Subjects already
/// rewritten into package-URL form are not directly referenceable in a
/// registry and are skipped.
pub fn generate(view: &RunView<'_>) -> Result<Vec<Payload>> {
    let mut payloads = Vec::new();
    for subject in &view.subjects {
        if subject.name.starts_with("pkg:") {
            continue;
        }
        let Some((alg, hex)) = subject.digest.iter().next() else {
            continue;
        };
        let body = SigPayload {
            critical: Critical {
                identity: Identity {
                    docker_reference: subject.name.clone(),
                },
                image: Image {
                    docker_manifest_digest: format!("{alg}:{hex}"),
                },
                type_name: "container signature",
            },
            optional: BTreeMap::new(),
        };
        payloads.push(Payload {
            full_key: Some(subject.full_key()),
            body: serde_json::to_value(body)?,
        });
    }
    Ok(payloads)
}
