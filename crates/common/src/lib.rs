//! BuildSeal Common Library
//!
//! The provenance engine: run-object model, artifact extraction,
//! resolved-dependency assembly, attestation formatters, signing, and
//! workload-identity verification. The daemon crate drives these pieces
//! from its reconcile loop.

pub mod artifacts;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod formats;
pub mod material;
pub mod objects;
pub mod svid;
pub mod types;
pub mod uri;

// Re-export commonly used types
pub use artifacts::{extract_subjects, Subject};
pub use config::EngineConfig;
pub use crypto::{KeyAlgorithm, KeyPair};
pub use envelope::{Envelope, TimestampAuthority};
pub use error::{Error, Result};
pub use formats::{generate_payloads, Payload, PayloadFormat, RunView};
pub use material::{resolved_dependencies, Material};
pub use objects::{RunKind, RunObject};
pub use svid::TrustBundle;
pub use types::*;

/// BuildSeal version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
