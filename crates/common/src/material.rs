//! Resolved-dependency assembly
//!
//! Builds the full list of build inputs for a run: the run's own
//! descriptor, step and sidecar images, structured artifact inputs, git
//! sources, and legacy resource bindings, de-duplicated in insertion
//! order. Pipeline and task descriptors survive de-duplication
//! unconditionally.

use crate::artifacts::results;
use crate::objects::RunObject;
use crate::types::{base64_bytes, Param, RunResult, TaskRun, Value};
use crate::uri;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Dependency name labels
pub mod labels {
    pub const PIPELINE: &str = "pipeline";
    pub const TASK: &str = "task";
    pub const PIPELINE_TASK: &str = "pipelineTask";
    pub const INPUT_RESULT: &str = "inputs/result";
    pub const PIPELINE_RESOURCE: &str = "pipelineResource";
}

/// A build input: URI, digest map, optional name label, optional opaque
/// content blob (only used for embedded run descriptors).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub uri: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub digest: BTreeMap<String, String>,
    #[serde(
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty",
        default
    )]
    pub content: Vec<u8>,
}

impl Material {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            name: None,
            uri: uri.into(),
            digest: BTreeMap::new(),
            content: Vec::new(),
        }
    }

    pub fn with_digest(mut self, algorithm: &str, hex: &str) -> Self {
        self.digest.insert(algorithm.to_string(), hex.to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    fn identity(&self) -> (String, String, Vec<u8>) {
        let digest = self
            .digest
            .iter()
            .map(|(a, h)| format!("{a}:{h}"))
            .collect::<Vec<_>>()
            .join(",");
        (self.uri.clone(), digest, self.content.clone())
    }

    fn always_retained(&self) -> bool {
        matches!(
            self.name.as_deref(),
            Some(labels::TASK) | Some(labels::PIPELINE)
        )
    }
}

/// How run descriptors are recorded as dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorStrategy {
    /// Record only {name, uri, digest}.
    Slsa,
    /// Additionally embed the serialized run object as the content blob.
    Embedded,
}

impl DescriptorStrategy {
    /// Strategy implied by a build-type URI: the native build type embeds
    /// run descriptors, everything else records the slim form.
    pub fn for_build_type(build_type: &str) -> Self {
        if build_type.contains("buildseal.dev") {
            DescriptorStrategy::Embedded
        } else {
            DescriptorStrategy::Slsa
        }
    }
}

/// Options steering dependency assembly.
#[derive(Debug, Clone, Copy)]
pub struct DependencyOptions {
    pub strategy: DescriptorStrategy,
    /// Include artifact inputs declared at step level.
    pub include_step_actions: bool,
}

impl Default for DependencyOptions {
    fn default() -> Self {
        Self {
            strategy: DescriptorStrategy::Slsa,
            include_step_actions: false,
        }
    }
}

/// Assemble the resolved dependencies for a run.
pub fn resolved_dependencies(run: &RunObject, opts: DependencyOptions) -> Vec<Material> {
    let mut out = Vec::new();
    match run {
        RunObject::Task(tr) => {
            push_descriptor(tr, labels::TASK, opts.strategy, &mut out);
            push_task_run_inputs(tr, opts, &mut out);
            push_value_inputs(&tr.spec.params, &tr.status.results, &mut out);
            push_resource_inputs(tr, &mut out);
        }
        RunObject::Pipeline(pr) => {
            if let Some(refs) = pr
                .status
                .provenance
                .as_ref()
                .and_then(|p| p.ref_source.as_ref())
            {
                out.push(descriptor_material(
                    labels::PIPELINE,
                    &refs.uri,
                    &refs.digest,
                    None,
                ));
            }
            for tr in run.executed_task_runs() {
                push_descriptor(tr, labels::PIPELINE_TASK, opts.strategy, &mut out);
                push_task_run_inputs(tr, opts, &mut out);
            }
            push_value_inputs(&pr.spec.params, &pr.status.results, &mut out);
        }
    }
    dedup(out)
}

/// De-duplicate on (uri, digest, content) preserving insertion order;
/// top-level pipeline/task descriptors are always retained.
fn dedup(materials: Vec<Material>) -> Vec<Material> {
    let mut seen: HashSet<(String, String, Vec<u8>)> = HashSet::new();
    let mut out = Vec::with_capacity(materials.len());
    for m in materials {
        if m.always_retained() || seen.insert(m.identity()) {
            out.push(m);
        }
    }
    out
}

fn descriptor_material(
    label: &str,
    uri_value: &str,
    digest: &BTreeMap<String, String>,
    content: Option<Vec<u8>>,
) -> Material {
    Material {
        name: Some(label.to_string()),
        uri: uri_value.to_string(),
        digest: digest.clone(),
        content: content.unwrap_or_default(),
    }
}

fn push_descriptor(
    tr: &TaskRun,
    label: &str,
    strategy: DescriptorStrategy,
    out: &mut Vec<Material>,
) {
    let Some(refs) = tr
        .status
        .provenance
        .as_ref()
        .and_then(|p| p.ref_source.as_ref())
    else {
        return;
    };
    let content = match strategy {
        DescriptorStrategy::Slsa => None,
        DescriptorStrategy::Embedded => serde_json::to_vec(tr).ok(),
    };
    out.push(descriptor_material(label, &refs.uri, &refs.digest, content));
}

/// Step images, sidecar images, then step-level artifact inputs.
fn push_task_run_inputs(tr: &TaskRun, opts: DependencyOptions, out: &mut Vec<Material>) {
    for step in &tr.status.steps {
        push_image(&step.image_id, out);
    }
    for sidecar in &tr.status.sidecars {
        push_image(&sidecar.image_id, out);
    }
    if opts.include_step_actions {
        for step in &tr.status.steps {
            for res in &step.results {
                if res.name.ends_with(results::SUFFIX_ARTIFACT_INPUTS) {
                    push_structured_input(res, out);
                }
            }
        }
    }
}

fn push_image(image_id: &str, out: &mut Vec<Material>) {
    if image_id.is_empty() {
        return;
    }
    match uri::ImageId::parse(image_id) {
        Ok(id) => out.push(Material::new(id.oci_uri()).with_digest(&id.algorithm, &id.hex)),
        Err(e) => warn!(image_id, "dropping unparsable image id: {}", e),
    }
}

/// Type-hinted inputs from params and results: git source pairs and
/// structured artifact inputs, labeled `inputs/result`.
fn push_value_inputs(params: &[Param], run_results: &[RunResult], out: &mut Vec<Material>) {
    let find = |name: &str| -> Option<&str> {
        params
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.value.as_str())
            .or_else(|| {
                run_results
                    .iter()
                    .find(|r| r.name == name)
                    .and_then(|r| r.value.as_str())
            })
    };

    if let (Some(url), Some(commit)) = (find(results::GIT_URL), find(results::GIT_COMMIT)) {
        out.push(
            Material::new(uri::git_dependency_uri(url))
                .with_digest("sha1", commit)
                .with_name(labels::INPUT_RESULT),
        );
    }

    for res in run_results {
        if res.name.ends_with(results::SUFFIX_ARTIFACT_INPUTS) {
            push_structured_input(res, out);
        }
    }
}

fn push_structured_input(res: &RunResult, out: &mut Vec<Material>) {
    let Value::Object(fields) = &res.value else {
        warn!(result = %res.name, "structured input is not an object, dropping");
        return;
    };
    let (Some(uri_value), Some(digest)) = (fields.get("uri"), fields.get("digest")) else {
        warn!(result = %res.name, "structured input missing uri or digest, dropping");
        return;
    };
    match uri::parse_digest(digest) {
        Ok((alg, hex)) => out.push(
            Material::new(uri_value.clone())
                .with_digest(&alg, &hex)
                .with_name(labels::INPUT_RESULT),
        ),
        Err(e) => warn!(result = %res.name, "dropping structured input: {}", e),
    }
}

/// Legacy resource bindings: git resources become source materials.
fn push_resource_inputs(tr: &TaskRun, out: &mut Vec<Material>) {
    for binding in &tr.spec.resources {
        if binding.resource_type != "git" {
            continue;
        }
        let (Some(url), Some(revision)) = (binding.param("url"), binding.param("revision")) else {
            continue;
        };
        out.push(
            Material::new(uri::git_dependency_uri(url))
                .with_digest("sha1", revision)
                .with_name(labels::PIPELINE_RESOURCE),
        );
    }
}
