//! Polymorphic run-object accessors
//!
//! The rest of the engine is version- and shape-agnostic: it sees a
//! [`RunObject`] and the uniform accessor set below, never a concrete
//! task-run or pipeline-run struct.

use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Run kind discriminator, used in keys and storage names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    TaskRun,
    PipelineRun,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunKind::TaskRun => write!(f, "taskrun"),
            RunKind::PipelineRun => write!(f, "pipelinerun"),
        }
    }
}

/// A run object: either a task-run or a pipeline-run
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind")]
pub enum RunObject {
    #[serde(rename = "TaskRun")]
    Task(TaskRun),
    #[serde(rename = "PipelineRun")]
    Pipeline(PipelineRun),
}

impl RunObject {
    pub fn kind(&self) -> RunKind {
        match self {
            RunObject::Task(_) => RunKind::TaskRun,
            RunObject::Pipeline(_) => RunKind::PipelineRun,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            RunObject::Task(t) => &t.meta,
            RunObject::Pipeline(p) => &p.meta,
        }
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn namespace(&self) -> &str {
        &self.meta().namespace
    }

    pub fn uid(&self) -> &str {
        &self.meta().uid
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.meta().annotations
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.meta().labels
    }

    pub fn api_version(&self) -> &str {
        match self {
            RunObject::Task(t) => &t.api_version,
            RunObject::Pipeline(p) => &p.api_version,
        }
    }

    /// Ordered result entries as delivered by the orchestrator. Values keep
    /// their wire type; no normalization happens here.
    pub fn results(&self) -> &[RunResult] {
        match self {
            RunObject::Task(t) => &t.status.results,
            RunObject::Pipeline(p) => &p.status.results,
        }
    }

    /// Ordered input parameters.
    pub fn params(&self) -> &[Param] {
        match self {
            RunObject::Task(t) => &t.spec.params,
            RunObject::Pipeline(p) => &p.spec.params,
        }
    }

    /// Ordered step states. Empty for pipeline-runs; steps live on the
    /// child task-runs.
    pub fn step_states(&self) -> &[StepState] {
        match self {
            RunObject::Task(t) => &t.status.steps,
            RunObject::Pipeline(_) => &[],
        }
    }

    pub fn sidecars(&self) -> &[SidecarState] {
        match self {
            RunObject::Task(t) => &t.status.sidecars,
            RunObject::Pipeline(_) => &[],
        }
    }

    pub fn provenance(&self) -> Option<&RunProvenance> {
        match self {
            RunObject::Task(t) => t.status.provenance.as_ref(),
            RunObject::Pipeline(p) => p.status.provenance.as_ref(),
        }
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self {
            RunObject::Task(t) => t.status.start_time,
            RunObject::Pipeline(p) => p.status.start_time,
        }
    }

    pub fn completion_time(&self) -> Option<DateTime<Utc>> {
        match self {
            RunObject::Task(t) => t.status.completion_time,
            RunObject::Pipeline(p) => p.status.completion_time,
        }
    }

    fn succeeded_condition(&self) -> Option<&Condition> {
        let conditions = match self {
            RunObject::Task(t) => &t.status.conditions,
            RunObject::Pipeline(p) => &p.status.conditions,
        };
        conditions.iter().find(|c| c.kind == "Succeeded")
    }

    /// True iff the succeeded condition is in a terminal state (true or
    /// false). A run is only consumed by the engine once terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.succeeded_condition().map(|c| c.status),
            Some(ConditionStatus::True) | Some(ConditionStatus::False)
        )
    }

    /// True iff terminal and the condition status is true.
    pub fn is_successful(&self) -> bool {
        matches!(
            self.succeeded_condition().map(|c| c.status),
            Some(ConditionStatus::True)
        )
    }

    /// The run references its definition via a resolver other than the
    /// in-cluster default.
    pub fn is_remote(&self) -> bool {
        match self {
            RunObject::Task(t) => t.spec.task_ref.as_ref().is_some_and(WorkloadRef::is_remote),
            RunObject::Pipeline(p) => p
                .spec
                .pipeline_ref
                .as_ref()
                .is_some_and(WorkloadRef::is_remote),
        }
    }

    /// Image-pull secret names from the effective pod template.
    pub fn pull_secrets(&self) -> &[String] {
        let template = match self {
            RunObject::Task(t) => t.spec.pod_template.as_ref(),
            RunObject::Pipeline(p) => p.spec.pod_template.as_ref(),
        };
        template.map(|t| t.image_pull_secrets.as_slice()).unwrap_or(&[])
    }

    /// Pipeline-run only: child task-runs whose completion time is set,
    /// in the order the pipeline spec defines them. Children the spec does
    /// not mention (retries, orphaned labels) keep their delivery order at
    /// the end.
    pub fn executed_task_runs(&self) -> Vec<&TaskRun> {
        let RunObject::Pipeline(p) = self else {
            return Vec::new();
        };
        let completed: Vec<&TaskRun> = p
            .status
            .child_runs
            .iter()
            .filter(|tr| tr.status.completion_time.is_some())
            .collect();

        let Some(spec) = &p.status.pipeline_spec else {
            return completed;
        };

        let mut ordered = Vec::with_capacity(completed.len());
        for task in &spec.tasks {
            for tr in &completed {
                if tr.meta.labels.get(PIPELINE_TASK_LABEL).map(String::as_str)
                    == Some(task.name.as_str())
                {
                    ordered.push(*tr);
                }
            }
        }
        for tr in completed {
            if !ordered.iter().any(|o| std::ptr::eq(*o, tr)) {
                ordered.push(tr);
            }
        }
        ordered
    }

    /// Pipeline-run only: look up the child task-run attached for the named
    /// pipeline task.
    pub fn get_task_run_from_task(&self, task_name: &str) -> Option<&TaskRun> {
        let RunObject::Pipeline(p) = self else {
            return None;
        };
        p.status.child_runs.iter().find(|tr| {
            tr.meta.labels.get(PIPELINE_TASK_LABEL).map(String::as_str) == Some(task_name)
        })
    }

    /// Planned tasks from the pipeline spec, empty for task-runs.
    pub fn pipeline_tasks(&self) -> &[PipelineTask] {
        match self {
            RunObject::Pipeline(p) => p
                .status
                .pipeline_spec
                .as_ref()
                .map(|s| s.tasks.as_slice())
                .unwrap_or(&[]),
            RunObject::Task(_) => &[],
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::types::*;

    #[test]
    fn terminal_and_successful() {
        let mut tr = task_run("build", vec![]);
        let run = RunObject::Task(tr.clone());
        assert!(run.is_terminal());
        assert!(run.is_successful());

        tr.status.conditions = vec![Condition::succeeded(ConditionStatus::False)];
        let failed = RunObject::Task(tr.clone());
        assert!(failed.is_terminal());
        assert!(!failed.is_successful());

        tr.status.conditions = vec![Condition::succeeded(ConditionStatus::Unknown)];
        let running = RunObject::Task(tr);
        assert!(!running.is_terminal());
    }

    #[test]
    fn executed_task_runs_follow_spec_order() {
        let clone = child_of("clone", task_run("pr-clone", vec![]));
        let build = child_of("build", task_run("pr-build", vec![]));
        let mut pending = child_of("push", task_run("pr-push", vec![]));
        pending.status.completion_time = None;

        let pr = PipelineRun {
            api_version: API_VERSION_V1.to_string(),
            meta: ObjectMeta {
                name: "pr".into(),
                uid: "uid-pr".into(),
                ..Default::default()
            },
            spec: PipelineRunSpec::default(),
            status: PipelineRunStatus {
                conditions: succeeded_condition(),
                pipeline_spec: Some(PipelineSpec {
                    tasks: vec![
                        PipelineTask {
                            name: "clone".into(),
                            ..Default::default()
                        },
                        PipelineTask {
                            name: "build".into(),
                            ..Default::default()
                        },
                        PipelineTask {
                            name: "push".into(),
                            ..Default::default()
                        },
                    ],
                }),
                // Delivery order differs from spec order on purpose.
                child_runs: vec![build, pending, clone],
                ..Default::default()
            },
        };

        let run = RunObject::Pipeline(pr);
        let executed: Vec<&str> = run
            .executed_task_runs()
            .iter()
            .map(|tr| tr.meta.name.as_str())
            .collect();
        assert_eq!(executed, vec!["pr-clone", "pr-build"]);
    }

    #[test]
    fn task_run_lookup_by_label() {
        let pr = PipelineRun {
            status: PipelineRunStatus {
                child_runs: vec![child_of("build", task_run("pr-build", vec![]))],
                ..Default::default()
            },
            ..Default::default()
        };
        let run = RunObject::Pipeline(pr);
        assert!(run.get_task_run_from_task("build").is_some());
        assert!(run.get_task_run_from_task("deploy").is_none());
    }
}
