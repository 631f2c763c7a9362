//! Core run-object types for BuildSeal
//!
//! Typed view over the orchestrator's task-run and pipeline-run objects.
//! These structs mirror the wire shapes the watch API delivers; BuildSeal
//! only ever reads them. The single annotation write goes through the
//! orchestrator client, never through these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Supported run-object API versions.
pub const API_VERSION_V1: &str = "v1";
pub const API_VERSION_V1BETA1: &str = "v1beta1";

/// Label the orchestrator sets on a child task-run naming its pipeline task.
pub const PIPELINE_TASK_LABEL: &str = "pipelineTask";

/// The in-cluster resolver name; anything else means the run definition
/// was fetched remotely.
pub const DEFAULT_RESOLVER: &str = "cluster";

/// Object metadata common to all run objects
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// Status of the succeeded condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Default for ConditionStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// A single status condition on a run object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Condition {
    pub fn succeeded(status: ConditionStatus) -> Self {
        Self {
            kind: "Succeeded".to_string(),
            status,
            reason: None,
        }
    }
}

/// A parameter or result value: string, array, or object of named fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Array(Vec<String>),
    Object(BTreeMap<String, String>),
}

impl Default for Value {
    fn default() -> Self {
        Self::String(String::new())
    }
}

impl Value {
    /// String content, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Object field lookup, if this is an object value.
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            Value::Object(m) => m.get(name).map(String::as_str),
            _ => None,
        }
    }

    /// Canonical bytes for hashing and signature checks. Strings are raw;
    /// arrays and objects serialize as JSON with sorted keys.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Value::String(s) => s.as_bytes().to_vec(),
            other => serde_json::to_vec(other).unwrap_or_default(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

/// An input parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: Value,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A result entry produced by a run or a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub name: String,
    pub value: Value,
}

impl RunResult {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Termination details of a step container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepTermination {
    #[serde(default)]
    pub exit_code: i32,
}

/// State of a single step within a task-run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepState {
    #[serde(default)]
    pub name: String,
    /// Container image id of form `[scheme://]repo@alg:hex`
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub results: Vec<RunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated: Option<StepTermination>,
}

/// State of a sidecar container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SidecarState {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image_id: String,
}

/// Where the run's definition was resolved from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefSource {
    pub uri: String,
    #[serde(default)]
    pub digest: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

/// Provenance sub-structure attached by the orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunProvenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_source: Option<RefSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_flags: Option<BTreeMap<String, serde_json::Value>>,
}

/// Reference to the definition that produced a run: a local name or a
/// remote resolver reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(default)]
    pub params: Vec<Param>,
}

impl WorkloadRef {
    /// True when the definition comes from a resolver other than the
    /// in-cluster default.
    pub fn is_remote(&self) -> bool {
        match &self.resolver {
            Some(r) => r != DEFAULT_RESOLVER,
            None => false,
        }
    }
}

/// Effective pod template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
}

/// Legacy input resource bound to a task-run. Only git resources carry
/// provenance-relevant data (url + revision).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceBinding {
    pub name: String,
    #[serde(rename = "type", default)]
    pub resource_type: String,
    #[serde(default)]
    pub params: Vec<Param>,
}

impl ResourceBinding {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.value.as_str())
    }
}

/// Task-run specification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRunSpec {
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<WorkloadRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplate>,
    #[serde(default)]
    pub resources: Vec<ResourceBinding>,
}

/// Task-run status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRunStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub steps: Vec<StepState>,
    #[serde(default)]
    pub sidecars: Vec<SidecarState>,
    #[serde(default)]
    pub results: Vec<RunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<RunProvenance>,
    /// Resolved task definition, recorded verbatim for the build config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_spec: Option<serde_json::Value>,
}

/// A task-run: one atomic build step execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRun {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: TaskRunSpec,
    #[serde(default)]
    pub status: TaskRunStatus,
}

fn default_api_version() -> String {
    API_VERSION_V1.to_string()
}

/// When-expression guarding a pipeline task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhenExpression {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// A planned task within a pipeline spec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineTask {
    pub name: String,
    #[serde(default)]
    pub run_after: Vec<String>,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub when: Vec<WhenExpression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<WorkloadRef>,
}

/// Pipeline specification: the ordered list of planned tasks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub tasks: Vec<PipelineTask>,
}

/// Pipeline-run specification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineRunSpec {
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_ref: Option<WorkloadRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplate>,
}

/// Pipeline-run status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineRunStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub results: Vec<RunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<RunProvenance>,
    /// Resolved pipeline definition with its planned tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_spec: Option<PipelineSpec>,
    /// Task-run objects owned by this pipeline-run, one per executed task.
    #[serde(default)]
    pub child_runs: Vec<TaskRun>,
}

/// A pipeline-run: a composition of task-runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineRun {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: PipelineRunSpec,
    #[serde(default)]
    pub status: PipelineRunStatus,
}

/// Serde helper for byte fields carried as base64 strings
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
