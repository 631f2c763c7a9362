//! Engine configuration
//!
//! Settings that shape payload generation and marking. Endpoint and
//! process-level settings live with the daemon; everything here affects
//! the bytes of generated payloads, so two workers with the same
//! `EngineConfig` produce identical output for a given run.

use crate::formats::PayloadFormat;
use crate::material::{DependencyOptions, DescriptorStrategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// URI identifying this build system instance.
    #[serde(default = "default_builder_id")]
    pub builder_id: String,

    /// Build-type URI recorded in predicates; also selects the run
    /// descriptor strategy unless overridden.
    #[serde(default = "default_build_type")]
    pub build_type: String,

    /// Recurse into executed task-runs when attesting pipeline-runs.
    #[serde(default)]
    pub deep_inspection: bool,

    /// Payload formats to generate and store per run.
    #[serde(default = "default_payload_formats")]
    pub payload_formats: Vec<PayloadFormat>,

    /// Domain prefix for the annotations written on run objects.
    #[serde(default = "default_annotation_prefix")]
    pub annotation_prefix: String,

    /// Timestamp authority endpoint; signatures are countersigned when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_authority_url: Option<String>,

    /// Treat timestamp failures as fatal instead of best-effort.
    #[serde(default)]
    pub timestamp_required: bool,

    /// PEM bundle the workload credential must chain to. Identity
    /// verification runs only when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_bundle_path: Option<PathBuf>,

    /// Record artifact inputs declared at step level.
    #[serde(default)]
    pub include_step_actions: bool,

    /// Explicit descriptor strategy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor_strategy: Option<DescriptorStrategy>,
}

fn default_builder_id() -> String {
    "https://buildseal.dev/builder@v1".to_string()
}

fn default_build_type() -> String {
    "https://buildseal.dev/build-type/v1".to_string()
}

fn default_payload_formats() -> Vec<PayloadFormat> {
    vec![PayloadFormat::SlsaV10]
}

fn default_annotation_prefix() -> String {
    "buildseal.dev".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            builder_id: default_builder_id(),
            build_type: default_build_type(),
            deep_inspection: false,
            payload_formats: default_payload_formats(),
            annotation_prefix: default_annotation_prefix(),
            timestamp_authority_url: None,
            timestamp_required: false,
            trust_bundle_path: None,
            include_step_actions: false,
            descriptor_strategy: None,
        }
    }
}

impl EngineConfig {
    /// Annotation marking a run as signed; the idempotence token.
    pub fn signed_annotation(&self) -> String {
        format!("{}/signed", self.annotation_prefix)
    }

    /// Annotation marking a run as rejected by identity verification.
    pub fn failed_verification_annotation(&self) -> String {
        format!("{}/failed-verification", self.annotation_prefix)
    }

    /// Annotation carrying a stored payload for the given format.
    pub fn payload_annotation(&self, format: PayloadFormat) -> String {
        format!("{}/{}-payload", self.annotation_prefix, format)
    }

    /// Annotation carrying a stored signature for the given format.
    pub fn signature_annotation(&self, format: PayloadFormat) -> String {
        format!("{}/{}-signature", self.annotation_prefix, format)
    }

    /// Options for the resolved-dependencies builder.
    pub fn dependency_options(&self) -> DependencyOptions {
        DependencyOptions {
            strategy: self
                .descriptor_strategy
                .unwrap_or_else(|| DescriptorStrategy::for_build_type(&self.build_type)),
            include_step_actions: self.include_step_actions,
        }
    }
}
