//! Attestation payload formatters
//!
//! Four interchangeable payload shapes produced from the same canonical
//! run view. Payload bytes are deterministic for a given run and
//! configuration: digest maps are `BTreeMap`s, JSON objects serialize
//! with sorted keys, and timestamps render as whole-second UTC RFC 3339.

pub mod intoto01;
pub mod simplesigning;
pub mod slsa02;
pub mod slsa10;

use crate::artifacts::{extract_subjects, Subject};
use crate::config::EngineConfig;
use crate::envelope::{PAYLOAD_TYPE_IN_TOTO, PAYLOAD_TYPE_SIMPLE_SIGNING};
use crate::material::{resolved_dependencies, Material};
use crate::objects::RunObject;
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Statement type URI shared by all in-toto statements
pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v0.1";
/// Predicate type for provenance v0.1
pub const PREDICATE_PROVENANCE_V01: &str = "https://in-toto.io/Provenance/v0.1";
/// Predicate type for SLSA provenance v0.2
pub const PREDICATE_SLSA_V02: &str = "https://slsa.dev/provenance/v0.2";
/// Predicate type for SLSA provenance v1.0
pub const PREDICATE_SLSA_V10: &str = "https://slsa.dev/provenance/v1";

/// The selectable payload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadFormat {
    #[serde(rename = "simplesigning")]
    SimpleSigning,
    #[serde(rename = "intoto-0.1")]
    InTotoV01,
    #[serde(rename = "slsa-0.2")]
    SlsaV02,
    #[serde(rename = "slsa-1.0")]
    SlsaV10,
}

impl PayloadFormat {
    pub const ALL: [PayloadFormat; 4] = [
        PayloadFormat::SimpleSigning,
        PayloadFormat::InTotoV01,
        PayloadFormat::SlsaV02,
        PayloadFormat::SlsaV10,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::SimpleSigning => "simplesigning",
            PayloadFormat::InTotoV01 => "intoto-0.1",
            PayloadFormat::SlsaV02 => "slsa-0.2",
            PayloadFormat::SlsaV10 => "slsa-1.0",
        }
    }

    /// MIME type recorded as the envelope payload type.
    pub fn payload_type(&self) -> &'static str {
        match self {
            PayloadFormat::SimpleSigning => PAYLOAD_TYPE_SIMPLE_SIGNING,
            _ => PAYLOAD_TYPE_IN_TOTO,
        }
    }
}

impl std::fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PayloadFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PayloadFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| Error::UnknownFormat(s.to_string()))
    }
}

/// An in-toto statement: header plus a format-specific predicate
#[derive(Debug, Serialize)]
pub struct Statement<P: Serialize> {
    #[serde(rename = "_type")]
    pub statement_type: &'static str,
    #[serde(rename = "predicateType")]
    pub predicate_type: &'static str,
    pub subject: Vec<Subject>,
    pub predicate: P,
}

/// One generated payload. `full_key` is set for per-subject formats and
/// names the artifact the payload refers to.
#[derive(Debug, Clone)]
pub struct Payload {
    pub full_key: Option<String>,
    pub body: serde_json::Value,
}

/// Pre-processed view over a run shared by all formatters
pub struct RunView<'a> {
    pub run: &'a RunObject,
    pub config: &'a EngineConfig,
    pub subjects: Vec<Subject>,
    pub dependencies: Vec<Material>,
}

impl<'a> RunView<'a> {
    pub fn new(run: &'a RunObject, config: &'a EngineConfig) -> Self {
        Self {
            run,
            config,
            subjects: extract_subjects(run, config.deep_inspection),
            dependencies: resolved_dependencies(run, config.dependency_options()),
        }
    }

    /// The run's unique id, recorded as the invocation id.
    pub fn invocation_id(&self) -> &str {
        self.run.uid()
    }

    pub fn started_on(&self) -> Option<String> {
        self.run.start_time().map(render_time)
    }

    pub fn finished_on(&self) -> Option<String> {
        self.run.completion_time().map(render_time)
    }

    /// The run spec's parameters as a JSON object.
    pub fn external_parameters(&self) -> serde_json::Map<String, serde_json::Value> {
        self.run
            .params()
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    serde_json::to_value(&p.value).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect()
    }

    /// Feature-flag snapshot from the run's provenance.
    pub fn feature_flags(&self) -> BTreeMap<String, serde_json::Value> {
        self.run
            .provenance()
            .and_then(|p| p.feature_flags.clone())
            .unwrap_or_default()
    }

    /// Annotations with the engine's own markers removed, so payload
    /// bytes do not depend on prior reconcile attempts.
    pub fn filtered_annotations(&self) -> BTreeMap<String, String> {
        let own_prefix = format!("{}/", self.config.annotation_prefix);
        self.run
            .annotations()
            .iter()
            .filter(|(k, _)| {
                !k.starts_with(&own_prefix)
                    && k.as_str() != "kubectl.kubernetes.io/last-applied-configuration"
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Feature flags plus filtered labels and annotations.
    pub fn internal_parameters(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        let flags = self.feature_flags();
        if !flags.is_empty() {
            map.insert(
                "feature-flags".to_string(),
                serde_json::to_value(flags).unwrap_or(serde_json::Value::Null),
            );
        }
        let labels = self.run.labels();
        if !labels.is_empty() {
            map.insert(
                "labels".to_string(),
                serde_json::to_value(labels).unwrap_or(serde_json::Value::Null),
            );
        }
        let annotations = self.filtered_annotations();
        if !annotations.is_empty() {
            map.insert(
                "annotations".to_string(),
                serde_json::to_value(annotations).unwrap_or(serde_json::Value::Null),
            );
        }
        map
    }
}

/// Whole-second UTC rendering keeps payload bytes stable across writers.
pub(crate) fn render_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Generate the payloads for a run in the given format.
pub fn generate_payloads(format: PayloadFormat, view: &RunView<'_>) -> Result<Vec<Payload>> {
    match format {
        PayloadFormat::SimpleSigning => simplesigning::generate(view),
        PayloadFormat::InTotoV01 => intoto01::generate(view),
        PayloadFormat::SlsaV02 => slsa02::generate(view),
        PayloadFormat::SlsaV10 => slsa10::generate(view),
    }
}
