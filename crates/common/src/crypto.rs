//! Cryptographic utilities for BuildSeal
//!
//! Key loading, signing, and verification across the three supported
//! algorithms. Ed25519 signs the message directly; ECDSA P-256 and RSA
//! sign through their SHA-256 digest signers. Key bytes are never logged.

use crate::{Error, Result};
use ed25519_dalek::Signer as _;
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::signature::Verifier as _;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Verifier as _};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Supported signing algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    Ed25519,
    EcdsaP256,
    Rsa2048,
}

/// A loaded private key
#[derive(Clone)]
pub enum KeyPair {
    Ed25519(ed25519_dalek::SigningKey),
    EcdsaP256(p256::ecdsa::SigningKey),
    Rsa(rsa::RsaPrivateKey),
}

impl KeyPair {
    /// Generate an ephemeral in-memory key.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self> {
        match algorithm {
            KeyAlgorithm::Ed25519 => Ok(Self::Ed25519(ed25519_dalek::SigningKey::generate(
                &mut OsRng,
            ))),
            KeyAlgorithm::EcdsaP256 => {
                Ok(Self::EcdsaP256(p256::ecdsa::SigningKey::random(&mut OsRng)))
            }
            KeyAlgorithm::Rsa2048 => rsa::RsaPrivateKey::new(&mut OsRng, 2048)
                .map(Self::Rsa)
                .map_err(|e| Error::Crypto(e.to_string())),
        }
    }

    /// Parse a PKCS#8 PEM private key, detecting the algorithm.
    pub fn from_pem(pem_text: &str) -> Result<Self> {
        if let Ok(key) = ed25519_dalek::SigningKey::from_pkcs8_pem(pem_text) {
            return Ok(Self::Ed25519(key));
        }
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem_text) {
            return Ok(Self::EcdsaP256(key));
        }
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_pem(pem_text) {
            return Ok(Self::Rsa(key));
        }
        Err(Error::Crypto("unsupported private key PEM".to_string()))
    }

    /// Load a PKCS#8 PEM private key from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_pem(&text)
    }

    /// Serialize to PKCS#8 PEM.
    pub fn to_pem(&self) -> Result<String> {
        use pkcs8::EncodePrivateKey;
        let pem = match self {
            Self::Ed25519(k) => k
                .to_pkcs8_pem(pkcs8::LineEnding::LF)
                .map_err(|e| Error::Crypto(e.to_string()))?,
            Self::EcdsaP256(k) => k
                .to_pkcs8_pem(pkcs8::LineEnding::LF)
                .map_err(|e| Error::Crypto(e.to_string()))?,
            Self::Rsa(k) => k
                .to_pkcs8_pem(pkcs8::LineEnding::LF)
                .map_err(|e| Error::Crypto(e.to_string()))?,
        };
        Ok(pem.to_string())
    }

    /// Save as PKCS#8 PEM.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path, self.to_pem()?).await?;
        Ok(())
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Ed25519(_) => KeyAlgorithm::Ed25519,
            Self::EcdsaP256(_) => KeyAlgorithm::EcdsaP256,
            Self::Rsa(_) => KeyAlgorithm::Rsa2048,
        }
    }

    /// The public key as SubjectPublicKeyInfo DER.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        let der = match self {
            Self::Ed25519(k) => k
                .verifying_key()
                .to_public_key_der()
                .map_err(|e| Error::Crypto(e.to_string()))?,
            Self::EcdsaP256(k) => k
                .verifying_key()
                .to_public_key_der()
                .map_err(|e| Error::Crypto(e.to_string()))?,
            Self::Rsa(k) => k
                .to_public_key()
                .to_public_key_der()
                .map_err(|e| Error::Crypto(e.to_string()))?,
        };
        Ok(der.into_vec())
    }

    /// Stable key identifier: hex SHA-256 over the SPKI DER.
    pub fn keyid(&self) -> Result<String> {
        let der = self.public_key_der()?;
        Ok(hex::encode(Sha256::digest(&der)))
    }

    /// Sign a message. ECDSA signatures are ASN.1 DER encoded; Ed25519 and
    /// RSA use their fixed encodings.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Ed25519(k) => Ok(k.sign(message).to_bytes().to_vec()),
            Self::EcdsaP256(k) => {
                let signature: p256::ecdsa::Signature = k.sign(message);
                Ok(signature.to_der().to_bytes().to_vec())
            }
            Self::Rsa(k) => {
                let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(k.clone());
                use rsa::signature::Signer as _;
                Ok(signing_key.sign(message).to_vec())
            }
        }
    }

    /// Verify a signature produced by [`KeyPair::sign`].
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        verify_with_spki_der(&self.public_key_der()?, message, signature)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm())
            .field("keyid", &self.keyid().unwrap_or_default())
            .finish()
    }
}

/// Verify a signature against a public key given as SubjectPublicKeyInfo
/// DER, dispatching on the key algorithm. ECDSA accepts both ASN.1 DER and
/// fixed-size signatures; ECDSA and RSA verify over SHA-256 of the
/// message, Ed25519 over the raw message.
pub fn verify_with_spki_der(spki_der: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(spki_der) {
        let sig = p256::ecdsa::Signature::from_der(signature)
            .or_else(|_| p256::ecdsa::Signature::from_slice(signature))
            .map_err(|e| Error::Crypto(format!("invalid ECDSA signature: {e}")))?;
        return key
            .verify(message, &sig)
            .map_err(|e| Error::Crypto(format!("ECDSA verification failed: {e}")));
    }
    if let Ok(key) = rsa::RsaPublicKey::from_public_key_der(spki_der) {
        let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key);
        let sig = rsa::pkcs1v15::Signature::try_from(signature)
            .map_err(|e| Error::Crypto(format!("invalid RSA signature: {e}")))?;
        return verifying_key
            .verify(message, &sig)
            .map_err(|e| Error::Crypto(format!("RSA verification failed: {e}")));
    }
    if let Ok(key) = ed25519_dalek::VerifyingKey::from_public_key_der(spki_der) {
        let sig = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|e| Error::Crypto(format!("invalid Ed25519 signature: {e}")))?;
        use ed25519_dalek::Verifier as _;
        return key
            .verify(message, &sig)
            .map_err(|e| Error::Crypto(format!("Ed25519 verification failed: {e}")));
    }
    Err(Error::Crypto("unsupported public key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_all_algorithms() {
        for alg in [
            KeyAlgorithm::Ed25519,
            KeyAlgorithm::EcdsaP256,
            KeyAlgorithm::Rsa2048,
        ] {
            let key = KeyPair::generate(alg).unwrap();
            let message = b"provenance payload";
            let signature = key.sign(message).unwrap();
            key.verify(message, &signature)
                .unwrap_or_else(|e| panic!("{alg:?}: {e}"));
        }
    }

    #[test]
    fn tampered_signature_rejected() {
        let key = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        let message = b"payload";
        let mut signature = key.sign(message).unwrap();
        signature[0] ^= 0xff;
        assert!(key.verify(message, &signature).is_err());
    }

    #[test]
    fn wrong_message_rejected() {
        let key = KeyPair::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let signature = key.sign(b"payload").unwrap();
        assert!(key.verify(b"other payload", &signature).is_err());
    }

    #[test]
    fn pem_round_trip_preserves_keyid() {
        for alg in [KeyAlgorithm::Ed25519, KeyAlgorithm::EcdsaP256] {
            let key = KeyPair::generate(alg).unwrap();
            let pem_text = key.to_pem().unwrap();
            let reloaded = KeyPair::from_pem(&pem_text).unwrap();
            assert_eq!(key.keyid().unwrap(), reloaded.keyid().unwrap());
            assert_eq!(key.algorithm(), reloaded.algorithm());
        }
    }

    #[tokio::test]
    async fn key_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("signing.key");
        let key = KeyPair::generate(KeyAlgorithm::EcdsaP256).unwrap();
        key.save(&path).await.unwrap();
        let reloaded = KeyPair::load(&path).await.unwrap();
        assert_eq!(key.keyid().unwrap(), reloaded.keyid().unwrap());
    }

    #[test]
    fn keyid_is_hex_sha256() {
        let key = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        let keyid = key.keyid().unwrap();
        assert_eq!(keyid.len(), 64);
        assert!(keyid.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
