//! Build-artifact extraction
//!
//! Scans a run's results and step outputs and produces the subject list
//! for its attestation. Result names select the extraction rule via the
//! naming conventions below; a malformed digest or image id never fails
//! the run, it drops the offending element with a log line.

use crate::objects::RunObject;
use crate::types::{Param, RunResult, StepState, Value};
use crate::uri;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Result-name conventions (wire contract)
pub mod results {
    /// Subject digest keyed by a same-named param or result.
    pub const SUFFIX_DIGEST: &str = "_DIGEST";
    /// Historical hyphen form, accepted on input only.
    pub const SUFFIX_DIGEST_LEGACY: &str = "-DIGEST";
    pub const IMAGE_URL: &str = "IMAGE_URL";
    pub const IMAGE_DIGEST: &str = "IMAGE_DIGEST";
    /// Comma-separated `<uri>@<alg>:<hex>` list.
    pub const IMAGES: &str = "IMAGES";
    pub const SUFFIX_ARTIFACT_URI: &str = "_ARTIFACT_URI";
    pub const SUFFIX_ARTIFACT_DIGEST: &str = "_ARTIFACT_DIGEST";
    /// Structured object `{uri, digest, isBuildArtifact}` produced by a task.
    pub const SUFFIX_ARTIFACT_OUTPUTS: &str = "-ARTIFACT_OUTPUTS";
    /// Same shape, consumed by a task.
    pub const SUFFIX_ARTIFACT_INPUTS: &str = "-ARTIFACT_INPUTS";
    pub const GIT_URL: &str = "CHAINS-GIT_URL";
    pub const GIT_COMMIT: &str = "CHAINS-GIT_COMMIT";
    /// Per-run workload credential attached by the orchestrator.
    pub const SVID: &str = "SVID";
}

/// An attestation subject: artifact URI plus a single-entry digest map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub digest: BTreeMap<String, String>,
}

impl Subject {
    pub fn new(name: impl Into<String>, algorithm: &str, hex: &str) -> Self {
        let mut digest = BTreeMap::new();
        digest.insert(algorithm.to_string(), hex.to_string());
        Self {
            name: name.into(),
            digest,
        }
    }

    /// The identity used for de-duplication: name plus first digest entry.
    fn identity(&self) -> (String, String, String) {
        let (alg, hex) = self
            .digest
            .iter()
            .next()
            .map(|(a, h)| (a.clone(), h.clone()))
            .unwrap_or_default();
        (self.name.clone(), alg, hex)
    }

    /// Reference form `<name>@<alg>:<hex>` used as the per-subject storage key.
    pub fn full_key(&self) -> String {
        match self.digest.iter().next() {
            Some((alg, hex)) => format!("{}@{}:{}", self.name, alg, hex),
            None => self.name.clone(),
        }
    }
}

/// Accumulates subjects, dropping duplicates while preserving first
/// occurrence, and sorts by name on finish.
#[derive(Default)]
struct SubjectSet {
    seen: HashSet<(String, String, String)>,
    subjects: Vec<Subject>,
}

impl SubjectSet {
    fn push(&mut self, subject: Subject) {
        if self.seen.insert(subject.identity()) {
            self.subjects.push(subject);
        }
    }

    fn finish(mut self) -> Vec<Subject> {
        self.subjects.sort_by(|a, b| a.name.cmp(&b.name));
        self.subjects
    }
}

/// Extract the subject list for a run.
///
/// For pipeline-runs with deep inspection enabled, the subjects of each
/// executed task-run are merged in under the same de-duplication rules.
pub fn extract_subjects(run: &RunObject, deep_inspection: bool) -> Vec<Subject> {
    let mut set = SubjectSet::default();
    match run {
        RunObject::Task(t) => {
            subjects_from_results(&t.status.results, &t.spec.params, &mut set);
            subjects_from_steps(&t.status.steps, &mut set);
        }
        RunObject::Pipeline(p) => {
            subjects_from_results(&p.status.results, &p.spec.params, &mut set);
            if deep_inspection {
                for tr in run.executed_task_runs() {
                    subjects_from_results(&tr.status.results, &tr.spec.params, &mut set);
                    subjects_from_steps(&tr.status.steps, &mut set);
                }
            }
        }
    }
    set.finish()
}

/// Apply the result-level extraction rules in order; a result consumed by
/// an earlier rule never contributes again.
fn subjects_from_results(run_results: &[RunResult], params: &[Param], set: &mut SubjectSet) {
    let mut consumed: HashSet<&str> = HashSet::new();

    // Rule 1: structured outputs with isBuildArtifact gating.
    for res in run_results {
        if res.name.ends_with(results::SUFFIX_ARTIFACT_OUTPUTS) {
            consumed.insert(&res.name);
            if let Some(subject) = subject_from_structured(res) {
                set.push(subject);
            }
        }
    }

    // Rule 2: the scalar image pair and the multi-artifact list.
    let image_url = find_string(run_results, results::IMAGE_URL);
    let image_digest = find_string(run_results, results::IMAGE_DIGEST);
    if let (Some(url), Some(digest)) = (image_url, image_digest) {
        consumed.insert(results::IMAGE_URL);
        consumed.insert(results::IMAGE_DIGEST);
        match uri::parse_digest(digest) {
            Ok((alg, hex)) => set.push(Subject::new(url, &alg, &hex)),
            Err(e) => warn!(result = results::IMAGE_DIGEST, "skipping subject: {}", e),
        }
    }
    for res in run_results {
        if res.name == results::IMAGES {
            consumed.insert(&res.name);
            if let Some(list) = res.value.as_str() {
                for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                    match parse_images_entry(entry) {
                        Ok(subject) => set.push(subject),
                        Err(e) => warn!(entry, "skipping subject: {}", e),
                    }
                }
            }
        }
    }

    // Rule 3: generic scalar pairs sharing a prefix.
    for res in run_results {
        let Some(prefix) = res.name.strip_suffix(results::SUFFIX_ARTIFACT_URI) else {
            continue;
        };
        let digest_name = format!("{prefix}{}", results::SUFFIX_ARTIFACT_DIGEST);
        let Some(digest) = find_string(run_results, &digest_name) else {
            warn!(result = %res.name, "artifact uri without digest, omitting subject");
            continue;
        };
        consumed.insert(&res.name);
        if let Some(uri_value) = res.value.as_str() {
            match uri::parse_digest(digest) {
                Ok((alg, hex)) => set.push(Subject::new(uri_value, &alg, &hex)),
                Err(e) => warn!(result = %digest_name, "skipping subject: {}", e),
            }
        }
    }
    for res in run_results {
        if res.name.ends_with(results::SUFFIX_ARTIFACT_DIGEST) {
            consumed.insert(&res.name);
        }
    }

    // Rule 4: the legacy digest convention, underscore and hyphen forms.
    for res in run_results {
        if consumed.contains(res.name.as_str()) {
            continue;
        }
        let base = res
            .name
            .strip_suffix(results::SUFFIX_DIGEST)
            .or_else(|| res.name.strip_suffix(results::SUFFIX_DIGEST_LEGACY));
        let Some(base) = base else { continue };
        if base.is_empty() {
            continue;
        }
        let Some(digest) = res.value.as_str() else {
            continue;
        };
        let Some(name_value) = lookup_value(params, run_results, base) else {
            warn!(result = %res.name, "no value found for {}, omitting subject", base);
            continue;
        };
        match uri::parse_digest(digest) {
            Ok((alg, hex)) => {
                let name = if res.name == results::IMAGE_DIGEST {
                    uri::image_purl(name_value, &alg, &hex)
                } else {
                    name_value.to_string()
                };
                set.push(Subject::new(name, &alg, &hex));
            }
            Err(e) => warn!(result = %res.name, "skipping subject: {}", e),
        }
    }
}

/// Rule 5: structured outputs emitted at the step level.
fn subjects_from_steps(steps: &[StepState], set: &mut SubjectSet) {
    for step in steps {
        for res in &step.results {
            if res.name.ends_with(results::SUFFIX_ARTIFACT_OUTPUTS) {
                if let Some(subject) = subject_from_structured(res) {
                    set.push(subject);
                }
            }
        }
    }
}

/// Parse one `{uri, digest, isBuildArtifact}` object result into a subject.
///
/// `isBuildArtifact` must be the string `"true"`; an absent field keeps the
/// legacy behavior of treating the output as a build artifact, any other
/// value (including unknown strings) skips it.
fn subject_from_structured(res: &RunResult) -> Option<Subject> {
    let Value::Object(fields) = &res.value else {
        warn!(result = %res.name, "structured output is not an object, skipping");
        return None;
    };
    match fields.get("isBuildArtifact").map(String::as_str) {
        None | Some("true") => {}
        Some(_) => return None,
    }
    let uri_value = fields.get("uri")?;
    let digest = fields.get("digest")?;
    match uri::parse_digest(digest) {
        Ok((alg, hex)) => Some(Subject::new(uri_value.clone(), &alg, &hex)),
        Err(e) => {
            warn!(result = %res.name, "skipping structured output: {}", e);
            None
        }
    }
}

/// Parse one `IMAGES` entry `<uri>@<alg>:<hex>`; a missing algorithm
/// prefix means sha256.
fn parse_images_entry(entry: &str) -> crate::Result<Subject> {
    let (uri_value, digest) = entry
        .split_once('@')
        .ok_or_else(|| crate::Error::MalformedInput(format!("image entry without digest: {entry}")))?;
    if digest.contains(':') {
        let (alg, hex) = uri::parse_digest(digest)?;
        Ok(Subject::new(uri_value, &alg, &hex))
    } else if !digest.is_empty() && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(Subject::new(uri_value, "sha256", digest))
    } else {
        Err(crate::Error::MalformedInput(format!(
            "invalid image digest: {digest}"
        )))
    }
}

fn find_string<'a>(run_results: &'a [RunResult], name: &str) -> Option<&'a str> {
    run_results
        .iter()
        .find(|r| r.name == name)
        .and_then(|r| r.value.as_str())
}

/// Locate the artifact name for a legacy digest result: parameters first,
/// then results.
fn lookup_value<'a>(params: &'a [Param], run_results: &'a [RunResult], base: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|p| p.name == base)
        .and_then(|p| p.value.as_str())
        .or_else(|| find_string(run_results, base))
}
