//! Signed attestation envelopes
//!
//! Wraps a serialized statement in an envelope whose signature covers the
//! (payload type, payload) tuple through a length-prefixed
//! pre-authentication encoding, so neither can be swapped independently.

use crate::crypto::{verify_with_spki_der, KeyPair};
use crate::{Error, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

/// Payload MIME type for in-toto statements
pub const PAYLOAD_TYPE_IN_TOTO: &str = "application/vnd.in-toto+json";
/// Payload MIME type for simple image signatures
pub const PAYLOAD_TYPE_SIMPLE_SIGNING: &str = "application/vnd.dev.cosign.simplesigning.v1+json";

/// Key id recorded on countersignatures from a timestamp authority.
pub const TIMESTAMP_KEYID: &str = "timestamp-authority";

/// Pre-authentication encoding over the payload type and payload:
/// `DSSEv1 SP len(type) SP type SP len(payload) SP payload`.
pub fn pre_authentication_encoding(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = format!(
        "DSSEv1 {} {} {} ",
        payload_type.len(),
        payload_type,
        payload.len()
    )
    .into_bytes();
    pae.extend_from_slice(payload);
    pae
}

/// One signature over the envelope's pre-authentication encoding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyid: Option<String>,
    /// Base64-encoded signature bytes.
    pub sig: String,
}

/// A signed envelope: payload type, base64 payload, signatures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "payloadType")]
    pub payload_type: String,
    pub payload: String,
    pub signatures: Vec<SignatureEntry>,
}

impl Envelope {
    /// Sign a payload into an envelope.
    pub fn sign(key: &KeyPair, payload_type: &str, payload: &[u8]) -> Result<Self> {
        let pae = pre_authentication_encoding(payload_type, payload);
        let signature = key
            .sign(&pae)
            .map_err(|e| Error::Signing(e.to_string()))?;
        Ok(Self {
            payload_type: payload_type.to_string(),
            payload: BASE64.encode(payload),
            signatures: vec![SignatureEntry {
                keyid: Some(key.keyid().map_err(|e| Error::Signing(e.to_string()))?),
                sig: BASE64.encode(signature),
            }],
        })
    }

    /// Decode the payload bytes.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        Ok(BASE64.decode(&self.payload)?)
    }

    /// Verify the primary signature against a public key (SPKI DER).
    /// Countersignatures from a timestamp authority are not checked here.
    pub fn verify(&self, spki_der: &[u8]) -> Result<()> {
        let payload = self.payload_bytes()?;
        let pae = pre_authentication_encoding(&self.payload_type, &payload);
        let entry = self
            .signatures
            .iter()
            .find(|s| s.keyid.as_deref() != Some(TIMESTAMP_KEYID))
            .ok_or_else(|| Error::Crypto("envelope has no signature".to_string()))?;
        let sig = BASE64.decode(&entry.sig)?;
        verify_with_spki_der(spki_der, &pae, &sig)
    }

    /// Append a timestamp-authority token as a secondary signature.
    pub fn add_timestamp(&mut self, token: &[u8]) {
        self.signatures.push(SignatureEntry {
            keyid: Some(TIMESTAMP_KEYID.to_string()),
            sig: BASE64.encode(token),
        });
    }

    /// The primary signature in base64, as stored by backends.
    pub fn primary_signature(&self) -> Option<&str> {
        self.signatures
            .iter()
            .find(|s| s.keyid.as_deref() != Some(TIMESTAMP_KEYID))
            .map(|s| s.sig.as_str())
    }
}

/// A remote authority that countersigns signatures with a time-stamp token.
#[async_trait]
pub trait TimestampAuthority: Send + Sync {
    async fn countersign(&self, signature: &[u8]) -> Result<Vec<u8>>;
}
