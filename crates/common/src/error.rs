//! Error types for BuildSeal

use thiserror::Error;

/// Result type alias using BuildSeal Error
pub type Result<T> = std::result::Result<T, Error>;

/// BuildSeal error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Identity verification failed: {0}")]
    VerificationFailed(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Storage backend {backend} failed: {message}")]
    Storage { backend: String, message: String },

    #[error("Annotation precondition conflict: {0}")]
    PreconditionConflict(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown payload format: {0}")]
    UnknownFormat(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the reconciler should requeue the work item.
    ///
    /// Malformed/missing inputs are absorbed by the extractor before they
    /// reach the reconcile loop; when one does surface it is permanent.
    /// Precondition conflicts are treated as success by the caller and
    /// never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Signing(_)
                | Error::Storage { .. }
                | Error::Cancelled(_)
                | Error::Timeout { .. }
                | Error::Transport(_)
        )
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::MalformedInput(format!("base64: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Signing("key unavailable".into()).is_transient());
        assert!(Error::Storage {
            backend: "oci".into(),
            message: "503".into()
        }
        .is_transient());
        assert!(Error::Timeout { seconds: 30 }.is_transient());

        assert!(!Error::MalformedInput("bad digest".into()).is_transient());
        assert!(!Error::VerificationFailed("no sig".into()).is_transient());
        assert!(!Error::UnknownFormat("slsa-9.9".into()).is_transient());
        assert!(!Error::PreconditionConflict("already marked".into()).is_transient());
    }
}
