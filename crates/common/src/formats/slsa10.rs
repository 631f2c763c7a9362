//! SLSA provenance v1.0 statements

use super::{Payload, RunView, Statement, PREDICATE_SLSA_V10, STATEMENT_TYPE};
use crate::material::Material;
use crate::objects::RunObject;
use crate::types::{base64_bytes, RunResult, TaskRun};
use crate::Result;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct SlsaV10Predicate {
    #[serde(rename = "buildDefinition")]
    pub build_definition: BuildDefinition,
    #[serde(rename = "runDetails")]
    pub run_details: RunDetails,
}

#[derive(Debug, Serialize)]
pub struct BuildDefinition {
    #[serde(rename = "buildType")]
    pub build_type: String,
    #[serde(rename = "externalParameters")]
    pub external_parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "internalParameters")]
    pub internal_parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "resolvedDependencies")]
    pub resolved_dependencies: Vec<Material>,
}

#[derive(Debug, Serialize)]
pub struct RunDetails {
    pub builder: Builder,
    pub metadata: Metadata,
    pub byproducts: Vec<ResourceDescriptor>,
}

#[derive(Debug, Serialize)]
pub struct Builder {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    #[serde(rename = "invocationId")]
    pub invocation_id: String,
    #[serde(rename = "startedOn", skip_serializing_if = "Option::is_none")]
    pub started_on: Option<String>,
    #[serde(rename = "finishedOn", skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<String>,
}

/// A by-product carried as an embedded resource descriptor
#[derive(Debug, Serialize)]
pub struct ResourceDescriptor {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(rename = "mediaType")]
    pub media_type: &'static str,
}

const MEDIA_TYPE_JSON: &str = "application/json";

pub fn generate(view: &RunView<'_>) -> Result<Vec<Payload>> {
    let statement = Statement {
        statement_type: STATEMENT_TYPE,
        predicate_type: PREDICATE_SLSA_V10,
        subject: view.subjects.clone(),
        predicate: SlsaV10Predicate {
            build_definition: BuildDefinition {
                build_type: view.config.build_type.clone(),
                external_parameters: view.external_parameters(),
                internal_parameters: view.internal_parameters(),
                resolved_dependencies: view.dependencies.clone(),
            },
            run_details: RunDetails {
                builder: Builder {
                    id: view.config.builder_id.clone(),
                },
                metadata: Metadata {
                    invocation_id: view.invocation_id().to_string(),
                    started_on: view.started_on(),
                    finished_on: view.finished_on(),
                },
                byproducts: byproducts(view)?,
            },
        },
    };

    Ok(vec![Payload {
        full_key: None,
        body: serde_json::to_value(statement)?,
    }])
}

/// Results serialized in definition order, then per-task status snapshots.
fn byproducts(view: &RunView<'_>) -> Result<Vec<ResourceDescriptor>> {
    let mut out = Vec::new();
    match view.run {
        RunObject::Task(tr) => {
            push_results(&mut out, "taskRunResults", &tr.meta.name, &tr.status.results)?;
            push_step_results(&mut out, tr)?;
        }
        RunObject::Pipeline(pr) => {
            push_results(
                &mut out,
                "pipelineRunResults",
                &pr.meta.name,
                &pr.status.results,
            )?;
            for tr in view.run.executed_task_runs() {
                push_results(&mut out, "taskRunResults", &tr.meta.name, &tr.status.results)?;
                push_step_results(&mut out, tr)?;
                out.push(ResourceDescriptor {
                    name: format!("taskRunStatus/{}", tr.meta.name),
                    content: serde_json::to_vec(&serde_json::json!({
                        "status": super::slsa02::run_status(tr),
                    }))?,
                    media_type: MEDIA_TYPE_JSON,
                });
            }
        }
    }
    Ok(out)
}

fn push_results(
    out: &mut Vec<ResourceDescriptor>,
    group: &str,
    run_name: &str,
    run_results: &[RunResult],
) -> Result<()> {
    for res in run_results {
        out.push(ResourceDescriptor {
            name: format!("{group}/{run_name}/{}", res.name),
            content: serde_json::to_vec(&res.value)?,
            media_type: MEDIA_TYPE_JSON,
        });
    }
    Ok(())
}

fn push_step_results(out: &mut Vec<ResourceDescriptor>, tr: &TaskRun) -> Result<()> {
    for step in &tr.status.steps {
        push_results(out, "stepResults", &tr.meta.name, &step.results)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::objects::fixtures::{child_of, succeeded_condition, task_run};
    use crate::types::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    /// The end-to-end shape of a single-image task-run with a git input.
    #[test]
    fn single_image_task_run_with_git_input() {
        let mut tr = task_run(
            "build",
            vec![
                RunResult::new("IMAGE_URL", "reg.example/img"),
                RunResult::new("IMAGE_DIGEST", "sha256:aaaa"),
            ],
        );
        tr.spec.params.push(Param::new("CHAINS-GIT_COMMIT", "abcd"));
        tr.spec.params.push(Param::new("CHAINS-GIT_URL", "https://git.x/y"));
        tr.status.steps.push(StepState {
            name: "build".into(),
            image_id: "docker://docker.io/base@sha256:bbbb".into(),
            results: vec![],
            terminated: Some(StepTermination { exit_code: 0 }),
        });

        let run = RunObject::Task(tr);
        let config = EngineConfig::default();
        let view = RunView::new(&run, &config);
        let body = &generate(&view).unwrap()[0].body;

        assert_eq!(body["predicateType"], PREDICATE_SLSA_V10);
        assert_eq!(
            body["subject"],
            serde_json::json!([
                {"name": "reg.example/img", "digest": {"sha256": "aaaa"}}
            ])
        );

        let deps = body["predicate"]["buildDefinition"]["resolvedDependencies"]
            .as_array()
            .unwrap();
        assert!(deps.iter().any(|d| d["uri"] == "oci://docker.io/base"
            && d["digest"]["sha256"] == "bbbb"));
        assert!(deps.iter().any(|d| d["name"] == "inputs/result"
            && d["uri"] == "git+https://git.x/y.git"
            && d["digest"]["sha1"] == "abcd"));

        assert_eq!(
            body["predicate"]["runDetails"]["metadata"]["invocationId"],
            "uid-build"
        );
        assert_eq!(
            body["predicate"]["runDetails"]["metadata"]["startedOn"],
            "2024-03-01T10:00:00Z"
        );
    }

    #[test]
    fn byproducts_carry_results_and_status() {
        let child = child_of(
            "build",
            task_run("pr-build", vec![RunResult::new("digest", "sha256:aaaa")]),
        );
        let pr = PipelineRun {
            meta: ObjectMeta {
                name: "pr".into(),
                uid: "uid-pr".into(),
                ..Default::default()
            },
            status: PipelineRunStatus {
                conditions: succeeded_condition(),
                results: vec![RunResult::new("summary", "ok")],
                pipeline_spec: Some(PipelineSpec {
                    tasks: vec![PipelineTask {
                        name: "build".into(),
                        ..Default::default()
                    }],
                }),
                child_runs: vec![child],
                ..Default::default()
            },
            ..Default::default()
        };

        let run = RunObject::Pipeline(pr);
        let config = EngineConfig {
            deep_inspection: true,
            ..Default::default()
        };
        let view = RunView::new(&run, &config);
        let body = &generate(&view).unwrap()[0].body;

        let byproducts = body["predicate"]["runDetails"]["byproducts"]
            .as_array()
            .unwrap();
        let names: Vec<&str> = byproducts
            .iter()
            .map(|b| b["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "pipelineRunResults/pr/summary",
                "taskRunResults/pr-build/digest",
                "taskRunStatus/pr-build",
            ]
        );

        let status_content = BASE64
            .decode(byproducts[2]["content"].as_str().unwrap())
            .unwrap();
        assert_eq!(status_content, br#"{"status":"Succeeded"}"#.to_vec());
        assert_eq!(byproducts[0]["mediaType"], "application/json");
    }

    #[test]
    fn empty_run_is_still_attestable() {
        let mut tr = task_run("empty", vec![]);
        tr.status.start_time = None;
        tr.status.completion_time = None;
        let run = RunObject::Task(tr);
        let config = EngineConfig::default();
        let view = RunView::new(&run, &config);
        let body = &generate(&view).unwrap()[0].body;

        assert_eq!(body["subject"], serde_json::json!([]));
        let metadata = body["predicate"]["runDetails"]["metadata"].as_object().unwrap();
        assert!(!metadata.contains_key("startedOn"));
        assert!(!metadata.contains_key("finishedOn"));
    }

    /// Two identical runs must produce byte-identical payloads.
    #[test]
    fn payload_bytes_deterministic() {
        let build = |uid: &str| {
            let mut tr = task_run(
                "build",
                vec![
                    RunResult::new("IMAGE_URL", "reg/img"),
                    RunResult::new("IMAGE_DIGEST", "sha256:abcd"),
                ],
            );
            tr.meta.uid = uid.to_string();
            tr.meta
                .labels
                .insert("team".to_string(), "platform".to_string());
            RunObject::Task(tr)
        };
        let config = EngineConfig::default();

        let a = build("uid-same");
        let b = build("uid-same");
        let bytes_a =
            serde_json::to_vec(&generate(&RunView::new(&a, &config)).unwrap()[0].body).unwrap();
        let bytes_b =
            serde_json::to_vec(&generate(&RunView::new(&b, &config)).unwrap()[0].body).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }
}
