//! Workload-identity verification
//!
//! When the orchestrator attaches a short-lived X.509 credential to a
//! run's results under the name `SVID`, every other result must carry a
//! companion `<name>.sig` signature made with the credential's key, and
//! the credential must chain to the configured trust bundle. A failure
//! here is permanent for the run; the reconciler never retries it.

use crate::artifacts::results::SVID;
use crate::crypto::verify_with_spki_der;
use crate::objects::RunObject;
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use der::{Decode, Encode};
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;
use x509_cert::Certificate;

/// A set of PEM certificates workload credentials must chain to
#[derive(Clone)]
pub struct TrustBundle {
    certs: Vec<Certificate>,
}

impl TrustBundle {
    /// Parse a bundle of concatenated PEM certificates.
    pub fn from_pem(text: &str) -> Result<Self> {
        let blocks = pem::parse_many(text)
            .map_err(|e| Error::InvalidConfig(format!("trust bundle: {e}")))?;
        let mut certs = Vec::new();
        for block in blocks {
            if block.tag() != "CERTIFICATE" {
                continue;
            }
            let cert = Certificate::from_der(block.contents())
                .map_err(|e| Error::InvalidConfig(format!("trust bundle certificate: {e}")))?;
            certs.push(cert);
        }
        if certs.is_empty() {
            return Err(Error::InvalidConfig(
                "trust bundle contains no certificates".to_string(),
            ));
        }
        Ok(Self { certs })
    }

    /// Load a PEM bundle from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_pem(&text)
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Whether any bundle certificate signed the given certificate.
    fn issued(&self, cert: &Certificate) -> bool {
        let Ok(tbs) = cert.tbs_certificate.to_der() else {
            return false;
        };
        let Some(signature) = cert.signature.as_bytes() else {
            return false;
        };
        self.certs.iter().any(|issuer| {
            spki_der(issuer)
                .map(|spki| verify_with_spki_der(&spki, &tbs, signature).is_ok())
                .unwrap_or(false)
        })
    }
}

impl std::fmt::Debug for TrustBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustBundle")
            .field("certs", &self.certs.len())
            .finish()
    }
}

fn spki_der(cert: &Certificate) -> Result<Vec<u8>> {
    cert.tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::VerificationFailed(format!("credential public key: {e}")))
}

/// Verify that the run's declared results are attested by its workload
/// credential.
pub fn verify_run_results(run: &RunObject, bundle: &TrustBundle) -> Result<()> {
    let run_results = run.results();
    let svid_pem = run_results
        .iter()
        .find(|r| r.name == SVID)
        .and_then(|r| r.value.as_str())
        .ok_or_else(|| Error::VerificationFailed("run carries no workload credential".into()))?;

    let leaf = parse_certificate(svid_pem)?;
    check_validity(&leaf)?;
    if !bundle.issued(&leaf) {
        return Err(Error::VerificationFailed(
            "workload credential does not chain to the trust bundle".into(),
        ));
    }
    let leaf_spki = spki_der(&leaf)?;

    for res in run_results {
        if res.name == SVID || res.name.ends_with(".sig") {
            continue;
        }
        let sig_name = format!("{}.sig", res.name);
        let sig_b64 = run_results
            .iter()
            .find(|r| r.name == sig_name)
            .and_then(|r| r.value.as_str())
            .ok_or_else(|| {
                Error::VerificationFailed(format!("result {} has no signature", res.name))
            })?;
        let signature = BASE64.decode(sig_b64).map_err(|e| {
            Error::VerificationFailed(format!("result {}: signature is not base64: {e}", res.name))
        })?;
        verify_with_spki_der(&leaf_spki, &res.value.canonical_bytes(), &signature).map_err(
            |e| Error::VerificationFailed(format!("result {}: {e}", res.name)),
        )?;
        debug!(run = run.uid(), result = %res.name, "result signature verified");
    }
    Ok(())
}

fn parse_certificate(pem_text: &str) -> Result<Certificate> {
    let block = pem::parse(pem_text)
        .map_err(|e| Error::VerificationFailed(format!("credential is not PEM: {e}")))?;
    if block.tag() != "CERTIFICATE" {
        return Err(Error::VerificationFailed(format!(
            "credential has unexpected PEM tag {}",
            block.tag()
        )));
    }
    Certificate::from_der(block.contents())
        .map_err(|e| Error::VerificationFailed(format!("credential is not X.509: {e}")))
}

fn check_validity(cert: &Certificate) -> Result<()> {
    let validity = &cert.tbs_certificate.validity;
    let now = SystemTime::now();
    if now < validity.not_before.to_system_time() {
        return Err(Error::VerificationFailed(
            "workload credential is not yet valid".into(),
        ));
    }
    if now > validity.not_after.to_system_time() {
        return Err(Error::VerificationFailed(
            "workload credential has expired".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::fixtures::task_run;
    use crate::objects::RunObject;
    use crate::types::RunResult;
    use p256::ecdsa::signature::Signer as _;
    use p256::pkcs8::DecodePrivateKey;

    struct TestIdentity {
        bundle: TrustBundle,
        leaf_pem: String,
        leaf_key: p256::ecdsa::SigningKey,
    }

    fn issue_identity() -> TestIdentity {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(vec![]).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_params =
            rcgen::CertificateParams::new(vec!["run.builds.svc".to_string()]).unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        TestIdentity {
            bundle: TrustBundle::from_pem(&ca_cert.pem()).unwrap(),
            leaf_pem: leaf_cert.pem(),
            leaf_key: p256::ecdsa::SigningKey::from_pkcs8_der(&leaf_key.serialize_der())
                .unwrap(),
        }
    }

    fn sign_value(key: &p256::ecdsa::SigningKey, value: &str) -> String {
        let signature: p256::ecdsa::Signature = key.sign(value.as_bytes());
        BASE64.encode(signature.to_der().to_bytes())
    }

    #[test]
    fn attested_results_verify() {
        let identity = issue_identity();
        let tr = task_run(
            "build",
            vec![
                RunResult::new(SVID, identity.leaf_pem.as_str()),
                RunResult::new("result1", "artifact-digest"),
                RunResult::new(
                    "result1.sig",
                    sign_value(&identity.leaf_key, "artifact-digest").as_str(),
                ),
            ],
        );
        verify_run_results(&RunObject::Task(tr), &identity.bundle).unwrap();
    }

    #[test]
    fn missing_signature_blocks_run() {
        let identity = issue_identity();
        let tr = task_run(
            "build",
            vec![
                RunResult::new(SVID, identity.leaf_pem.as_str()),
                RunResult::new("result1", "artifact-digest"),
            ],
        );
        let err = verify_run_results(&RunObject::Task(tr), &identity.bundle).unwrap_err();
        assert!(matches!(err, Error::VerificationFailed(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn wrong_key_signature_rejected() {
        let identity = issue_identity();
        let other_key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let tr = task_run(
            "build",
            vec![
                RunResult::new(SVID, identity.leaf_pem.as_str()),
                RunResult::new("result1", "artifact-digest"),
                RunResult::new(
                    "result1.sig",
                    sign_value(&other_key, "artifact-digest").as_str(),
                ),
            ],
        );
        assert!(verify_run_results(&RunObject::Task(tr), &identity.bundle).is_err());
    }

    #[test]
    fn untrusted_issuer_rejected() {
        let identity = issue_identity();
        let other = issue_identity();
        let tr = task_run(
            "build",
            vec![RunResult::new(SVID, identity.leaf_pem.as_str())],
        );
        assert!(verify_run_results(&RunObject::Task(tr), &other.bundle).is_err());
    }

    #[test]
    fn absent_credential_rejected() {
        let identity = issue_identity();
        let tr = task_run("build", vec![RunResult::new("result1", "value")]);
        assert!(verify_run_results(&RunObject::Task(tr), &identity.bundle).is_err());
    }

    #[test]
    fn bundle_requires_certificates() {
        assert!(TrustBundle::from_pem("not pem at all").is_err());
    }
}
