//! SLSA provenance v0.2 statements
//!
//! Task-runs record their resolved task spec and results as the build
//! config; pipeline-runs record one entry per executed task with its
//! dataflow ordering. `after` is the union of the explicit `runAfter`
//! list and implicit references through `$(tasks.<t>.results.<r>)` in
//! parameters and when-expressions.

use super::{render_time, Payload, RunView, Statement, PREDICATE_SLSA_V02, STATEMENT_TYPE};
use crate::objects::RunObject;
use crate::types::{
    ConditionStatus, PipelineTask, TaskRun, Value, PIPELINE_TASK_LABEL,
};
use crate::{Error, Result};
use regex_lite::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Serialize)]
pub struct SlsaV02Predicate {
    pub builder: Builder,
    #[serde(rename = "buildType")]
    pub build_type: String,
    pub invocation: Invocation,
    #[serde(rename = "buildConfig")]
    pub build_config: serde_json::Value,
    pub materials: Vec<MaterialEntry>,
    pub metadata: Metadata,
}

#[derive(Debug, Serialize)]
pub struct Builder {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct Invocation {
    #[serde(rename = "configSource")]
    pub config_source: ConfigSource,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub environment: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Serialize)]
pub struct ConfigSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub digest: BTreeMap<String, String>,
    #[serde(rename = "entryPoint", skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MaterialEntry {
    pub uri: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub digest: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    #[serde(rename = "buildInvocationId")]
    pub build_invocation_id: String,
    #[serde(rename = "buildStartedOn", skip_serializing_if = "Option::is_none")]
    pub build_started_on: Option<String>,
    #[serde(rename = "buildFinishedOn", skip_serializing_if = "Option::is_none")]
    pub build_finished_on: Option<String>,
    pub completeness: Completeness,
    pub reproducible: bool,
}

#[derive(Debug, Serialize)]
pub struct Completeness {
    pub parameters: bool,
    pub environment: bool,
    pub materials: bool,
}

#[derive(Debug, Serialize)]
struct TaskEntry<'a> {
    name: &'a str,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    task_ref: Option<serde_json::Value>,
    after: Vec<String>,
    #[serde(rename = "startedOn", skip_serializing_if = "Option::is_none")]
    started_on: Option<String>,
    #[serde(rename = "finishedOn", skip_serializing_if = "Option::is_none")]
    finished_on: Option<String>,
    status: &'static str,
    steps: Vec<StepEntry<'a>>,
    invocation: serde_json::Value,
    results: &'a [crate::types::RunResult],
}

#[derive(Debug, Serialize)]
struct StepEntry<'a> {
    name: &'a str,
    #[serde(rename = "imageID")]
    image_id: &'a str,
    #[serde(rename = "exitCode")]
    exit_code: i32,
}

pub fn generate(view: &RunView<'_>) -> Result<Vec<Payload>> {
    let build_config = match view.run {
        RunObject::Task(tr) => task_build_config(tr),
        RunObject::Pipeline(_) => pipeline_build_config(view)?,
    };

    let ref_source = view.run.provenance().and_then(|p| p.ref_source.as_ref());
    let config_source = ref_source
        .map(|r| ConfigSource {
            uri: Some(r.uri.clone()),
            digest: r.digest.clone(),
            entry_point: r.entry_point.clone(),
        })
        .unwrap_or_default();

    let mut environment = serde_json::Map::new();
    let labels = view.run.labels();
    if !labels.is_empty() {
        environment.insert("labels".to_string(), serde_json::to_value(labels)?);
    }
    let annotations = view.filtered_annotations();
    if !annotations.is_empty() {
        environment.insert("annotations".to_string(), serde_json::to_value(annotations)?);
    }

    let statement = Statement {
        statement_type: STATEMENT_TYPE,
        predicate_type: PREDICATE_SLSA_V02,
        subject: view.subjects.clone(),
        predicate: SlsaV02Predicate {
            builder: Builder {
                id: view.config.builder_id.clone(),
            },
            build_type: view.config.build_type.clone(),
            invocation: Invocation {
                config_source,
                parameters: view.external_parameters(),
                environment,
            },
            build_config,
            materials: view
                .dependencies
                .iter()
                .map(|m| MaterialEntry {
                    uri: m.uri.clone(),
                    digest: m.digest.clone(),
                })
                .collect(),
            metadata: Metadata {
                build_invocation_id: view.invocation_id().to_string(),
                build_started_on: view.started_on(),
                build_finished_on: view.finished_on(),
                completeness: Completeness {
                    parameters: false,
                    environment: false,
                    materials: false,
                },
                reproducible: false,
            },
        },
    };

    Ok(vec![Payload {
        full_key: None,
        body: serde_json::to_value(statement)?,
    }])
}

fn task_build_config(tr: &TaskRun) -> serde_json::Value {
    serde_json::json!({
        "taskSpec": tr.status.task_spec,
        "taskRunResults": tr.status.results,
    })
}

fn pipeline_build_config(view: &RunView<'_>) -> Result<serde_json::Value> {
    let planned = view.run.pipeline_tasks();
    let after_map = compute_after(planned)?;

    let mut tasks = Vec::new();
    for tr in view.run.executed_task_runs() {
        let Some(task_name) = tr.meta.labels.get(PIPELINE_TASK_LABEL) else {
            continue;
        };
        let planned_task = planned.iter().find(|t| &t.name == task_name);
        let entry = TaskEntry {
            name: task_name,
            task_ref: planned_task
                .and_then(|t| t.task_ref.as_ref())
                .map(serde_json::to_value)
                .transpose()?,
            after: after_map.get(task_name).cloned().unwrap_or_default(),
            started_on: tr.status.start_time.map(render_time),
            finished_on: tr.status.completion_time.map(render_time),
            status: run_status(tr),
            steps: tr
                .status
                .steps
                .iter()
                .map(|s| StepEntry {
                    name: &s.name,
                    image_id: &s.image_id,
                    exit_code: s.terminated.as_ref().map(|t| t.exit_code).unwrap_or(0),
                })
                .collect(),
            invocation: serde_json::json!({
                "parameters": tr
                    .spec
                    .params
                    .iter()
                    .map(|p| (p.name.clone(), serde_json::to_value(&p.value).unwrap_or(serde_json::Value::Null)))
                    .collect::<serde_json::Map<_, _>>(),
            }),
            results: &tr.status.results,
        };
        tasks.push(serde_json::to_value(entry)?);
    }
    Ok(serde_json::json!({ "tasks": tasks }))
}

pub(crate) fn run_status(tr: &TaskRun) -> &'static str {
    let condition = tr
        .status
        .conditions
        .iter()
        .find(|c| c.kind == "Succeeded")
        .map(|c| c.status);
    match condition {
        Some(ConditionStatus::True) => "Succeeded",
        Some(ConditionStatus::False) => "Failed",
        _ => "Unknown",
    }
}

/// Union of explicit `runAfter` and implicit result references for each
/// planned task, rejecting cyclic plans.
fn compute_after(planned: &[PipelineTask]) -> Result<BTreeMap<String, Vec<String>>> {
    let result_ref = Regex::new(r"\$\(tasks\.([^.)\s]+)\.results\.").expect("static pattern");
    let known: HashSet<&str> = planned.iter().map(|t| t.name.as_str()).collect();

    let mut after_map = BTreeMap::new();
    for task in planned {
        let mut after: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if name != task.name && known.contains(name) && !after.iter().any(|a| a == name) {
                after.push(name.to_string());
            }
        };

        for dep in &task.run_after {
            push(dep);
        }
        for param in &task.params {
            for referenced in referenced_tasks(&result_ref, &param.value) {
                push(&referenced);
            }
        }
        for when in &task.when {
            for cap in result_ref.captures_iter(&when.input) {
                push(&cap[1]);
            }
            for value in &when.values {
                for cap in result_ref.captures_iter(value) {
                    push(&cap[1]);
                }
            }
        }
        after_map.insert(task.name.clone(), after);
    }

    detect_cycle(&after_map)?;
    Ok(after_map)
}

fn referenced_tasks(pattern: &Regex, value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    let mut scan = |s: &str| {
        for cap in pattern.captures_iter(s) {
            found.push(cap[1].to_string());
        }
    };
    match value {
        Value::String(s) => scan(s),
        Value::Array(items) => items.iter().for_each(|s| scan(s)),
        Value::Object(map) => map.values().for_each(|s| scan(s)),
    }
    found
}

/// Depth-first cycle check over the dependency edges. The orchestrator
/// contract forbids cycles, so finding one means the run is malformed.
fn detect_cycle(after_map: &BTreeMap<String, Vec<String>>) -> Result<()> {
    let mut settled: HashSet<&str> = HashSet::new();
    for start in after_map.keys() {
        if settled.contains(start.as_str()) {
            continue;
        }
        let mut in_progress: HashSet<&str> = HashSet::new();
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        in_progress.insert(start.as_str());
        while let Some((node, next_edge)) = stack.pop() {
            let edges = after_map.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if next_edge >= edges.len() {
                in_progress.remove(node);
                settled.insert(node);
                continue;
            }
            stack.push((node, next_edge + 1));
            let dep = edges[next_edge].as_str();
            if settled.contains(dep) {
                continue;
            }
            if !in_progress.insert(dep) {
                return Err(Error::MalformedInput(format!(
                    "task ordering cycle involving {dep}"
                )));
            }
            stack.push((dep, 0));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::objects::fixtures::{child_of, succeeded_condition, task_run};
    use crate::types::*;

    fn two_task_pipeline() -> PipelineRun {
        let clone = child_of(
            "clone",
            task_run(
                "pr-clone",
                vec![
                    RunResult::new("CHAINS-GIT_URL", "https://git.x/y"),
                    RunResult::new("CHAINS-GIT_COMMIT", "abcd"),
                ],
            ),
        );
        let build = child_of(
            "build",
            task_run(
                "pr-build",
                vec![
                    RunResult::new("IMAGE_URL", "reg/img"),
                    RunResult::new("IMAGE_DIGEST", "sha256:abcd"),
                ],
            ),
        );
        PipelineRun {
            api_version: API_VERSION_V1.to_string(),
            meta: ObjectMeta {
                name: "pr".into(),
                uid: "uid-pr".into(),
                ..Default::default()
            },
            spec: PipelineRunSpec::default(),
            status: PipelineRunStatus {
                start_time: Some("2024-03-01T10:00:00Z".parse().unwrap()),
                completion_time: Some("2024-03-01T10:10:00Z".parse().unwrap()),
                conditions: succeeded_condition(),
                pipeline_spec: Some(PipelineSpec {
                    tasks: vec![
                        PipelineTask {
                            name: "clone".into(),
                            ..Default::default()
                        },
                        PipelineTask {
                            name: "build".into(),
                            params: vec![Param::new("commit", "$(tasks.clone.results.commit)")],
                            ..Default::default()
                        },
                    ],
                }),
                child_runs: vec![clone, build],
                ..Default::default()
            },
        }
    }

    #[test]
    fn after_deduced_from_parameter_reference() {
        let run = RunObject::Pipeline(two_task_pipeline());
        let config = EngineConfig::default();
        let view = RunView::new(&run, &config);
        let body = &generate(&view).unwrap()[0].body;

        let tasks = body["predicate"]["buildConfig"]["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0]["name"], "clone");
        assert_eq!(tasks[0]["after"], serde_json::json!([]));
        assert_eq!(tasks[1]["name"], "build");
        assert_eq!(tasks[1]["after"], serde_json::json!(["clone"]));
        assert_eq!(tasks[1]["status"], "Succeeded");
    }

    #[test]
    fn explicit_and_when_references_union() {
        let planned = vec![
            PipelineTask {
                name: "a".into(),
                ..Default::default()
            },
            PipelineTask {
                name: "b".into(),
                ..Default::default()
            },
            PipelineTask {
                name: "c".into(),
                run_after: vec!["a".into()],
                when: vec![WhenExpression {
                    input: "$(tasks.b.results.ok)".into(),
                    operator: "in".into(),
                    values: vec!["true".into()],
                }],
                ..Default::default()
            },
        ];
        let after = compute_after(&planned).unwrap();
        assert_eq!(after["c"], vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn cycle_is_rejected() {
        let planned = vec![
            PipelineTask {
                name: "a".into(),
                run_after: vec!["b".into()],
                ..Default::default()
            },
            PipelineTask {
                name: "b".into(),
                run_after: vec!["a".into()],
                ..Default::default()
            },
        ];
        assert!(matches!(
            compute_after(&planned),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn unknown_task_references_ignored() {
        let planned = vec![PipelineTask {
            name: "only".into(),
            params: vec![Param::new("x", "$(tasks.ghost.results.y)")],
            ..Default::default()
        }];
        let after = compute_after(&planned).unwrap();
        assert!(after["only"].is_empty());
    }

    #[test]
    fn task_run_build_config_shape() {
        let mut tr = task_run("build", vec![RunResult::new("out", "value")]);
        tr.status.task_spec = Some(serde_json::json!({"steps": []}));
        let run = RunObject::Task(tr);
        let config = EngineConfig::default();
        let view = RunView::new(&run, &config);
        let body = &generate(&view).unwrap()[0].body;

        assert_eq!(
            body["predicate"]["buildConfig"]["taskSpec"],
            serde_json::json!({"steps": []})
        );
        assert_eq!(
            body["predicate"]["buildConfig"]["taskRunResults"][0]["name"],
            "out"
        );
        assert_eq!(body["predicate"]["metadata"]["buildInvocationId"], "uid-build");
    }
}
