//! Orchestrator client boundary
//!
//! The engine reads run objects and writes exactly one thing back:
//! annotations. Everything behind this trait belongs to the
//! orchestration platform. The in-memory implementation backs tests; the
//! HTTP adapter is the thin deployment client.

use async_trait::async_trait;
use buildseal_common::{Error, Result, RunKind, RunObject};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Identity of a run object within the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub kind: RunKind,
    pub namespace: String,
    pub name: String,
}

impl RunKey {
    pub fn new(kind: RunKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_run(run: &RunObject) -> Self {
        Self::new(run.kind(), run.namespace(), run.name())
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl FromStr for RunKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '/');
        let (Some(kind), Some(namespace), Some(name)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::MalformedInput(format!("run key: {s}")));
        };
        let kind = match kind {
            "taskrun" => RunKind::TaskRun,
            "pipelinerun" => RunKind::PipelineRun,
            other => return Err(Error::MalformedInput(format!("run kind: {other}"))),
        };
        Ok(Self::new(kind, namespace, name))
    }
}

/// Read runs and patch their annotations
#[async_trait]
pub trait RunClient: Send + Sync {
    async fn get_run(&self, key: &RunKey) -> Result<RunObject>;

    /// All run keys currently known; drives the periodic resync.
    async fn list_runs(&self) -> Result<Vec<RunKey>>;

    /// JSON-merge-patch the run's annotations.
    async fn patch_annotations(
        &self,
        key: &RunKey,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Patch annotations with a precondition that `guard` is absent;
    /// returns [`Error::PreconditionConflict`] when another writer set it
    /// first.
    async fn patch_annotations_if_absent(
        &self,
        key: &RunKey,
        guard: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;
}

/// In-memory orchestrator used by tests. Patches are applied atomically
/// and recorded so tests can assert on write counts.
#[derive(Default)]
pub struct InMemoryRunClient {
    runs: DashMap<String, RunObject>,
    patch_log: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl InMemoryRunClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and return its key.
    pub fn insert(&self, run: RunObject) -> RunKey {
        let key = RunKey::for_run(&run);
        self.runs.insert(key.to_string(), run);
        key
    }

    /// All annotation patches applied so far, in order.
    pub fn patches(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.patch_log.lock().clone()
    }

    pub fn patch_count(&self) -> usize {
        self.patch_log.lock().len()
    }
}

#[async_trait]
impl RunClient for InMemoryRunClient {
    async fn get_run(&self, key: &RunKey) -> Result<RunObject> {
        self.runs
            .get(&key.to_string())
            .map(|r| r.clone())
            .ok_or_else(|| Error::NotFound {
                kind: key.kind.to_string(),
                id: key.to_string(),
            })
    }

    async fn list_runs(&self) -> Result<Vec<RunKey>> {
        self.runs
            .iter()
            .map(|entry| entry.key().parse())
            .collect()
    }

    async fn patch_annotations(
        &self,
        key: &RunKey,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut entry = self
            .runs
            .get_mut(&key.to_string())
            .ok_or_else(|| Error::NotFound {
                kind: key.kind.to_string(),
                id: key.to_string(),
            })?;
        apply_annotations(entry.value_mut(), &annotations);
        self.patch_log.lock().push((key.to_string(), annotations));
        Ok(())
    }

    async fn patch_annotations_if_absent(
        &self,
        key: &RunKey,
        guard: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut entry = self
            .runs
            .get_mut(&key.to_string())
            .ok_or_else(|| Error::NotFound {
                kind: key.kind.to_string(),
                id: key.to_string(),
            })?;
        if entry.annotations().contains_key(guard) {
            return Err(Error::PreconditionConflict(format!(
                "{guard} already set on {key}"
            )));
        }
        apply_annotations(entry.value_mut(), &annotations);
        self.patch_log.lock().push((key.to_string(), annotations));
        Ok(())
    }
}

fn apply_annotations(run: &mut RunObject, annotations: &BTreeMap<String, String>) {
    let meta = match run {
        RunObject::Task(t) => &mut t.meta,
        RunObject::Pipeline(p) => &mut p.meta,
    };
    for (k, v) in annotations {
        meta.annotations.insert(k.clone(), v.clone());
    }
}

/// HTTP adapter against the orchestrator's read and patch endpoints.
pub struct HttpRunClient {
    base: String,
    client: reqwest::Client,
}

impl HttpRunClient {
    pub fn new(base: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn run_url(&self, key: &RunKey) -> String {
        format!(
            "{}/apis/{}s/{}/{}",
            self.base, key.kind, key.namespace, key.name
        )
    }
}

#[async_trait]
impl RunClient for HttpRunClient {
    async fn get_run(&self, key: &RunKey) -> Result<RunObject> {
        let response = self
            .client
            .get(self.run_url(key))
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound {
                kind: key.kind.to_string(),
                id: key.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "GET {}: {}",
                self.run_url(key),
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn list_runs(&self) -> Result<Vec<RunKey>> {
        let url = format!("{}/apis/runs", self.base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!("GET {url}: {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn patch_annotations(
        &self,
        key: &RunKey,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let body = serde_json::json!({ "metadata": { "annotations": annotations } });
        let response = self
            .client
            .patch(self.run_url(key))
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(Error::PreconditionConflict(key.to_string()));
        }
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "PATCH {}: {}",
                self.run_url(key),
                response.status()
            )));
        }
        Ok(())
    }

    async fn patch_annotations_if_absent(
        &self,
        key: &RunKey,
        guard: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        // Re-read and test the guard before patching. The merge-patch is
        // idempotent, so losing the race produces an identical write.
        let run = self.get_run(key).await?;
        if run.annotations().contains_key(guard) {
            return Err(Error::PreconditionConflict(format!(
                "{guard} already set on {key}"
            )));
        }
        self.patch_annotations(key, annotations).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildseal_common::types::{Condition, ConditionStatus, ObjectMeta, TaskRun, TaskRunStatus};

    fn make_run(name: &str) -> RunObject {
        RunObject::Task(TaskRun {
            meta: ObjectMeta {
                name: name.into(),
                namespace: "builds".into(),
                uid: format!("uid-{name}"),
                ..Default::default()
            },
            status: TaskRunStatus {
                conditions: vec![Condition::succeeded(ConditionStatus::True)],
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn run_key_round_trip() {
        let key = RunKey::new(RunKind::PipelineRun, "builds", "release-42");
        assert_eq!(key.to_string(), "pipelinerun/builds/release-42");
        assert_eq!(key.to_string().parse::<RunKey>().unwrap(), key);
        assert!("garbage".parse::<RunKey>().is_err());
    }

    #[tokio::test]
    async fn in_memory_patch_applies_annotations() {
        let client = InMemoryRunClient::new();
        let key = client.insert(make_run("build"));

        client
            .patch_annotations(&key, BTreeMap::from([("a/b".into(), "1".into())]))
            .await
            .unwrap();
        let run = client.get_run(&key).await.unwrap();
        assert_eq!(run.annotations().get("a/b").map(String::as_str), Some("1"));
        assert_eq!(client.patch_count(), 1);
    }

    #[tokio::test]
    async fn guarded_patch_conflicts_once_set() {
        let client = InMemoryRunClient::new();
        let key = client.insert(make_run("build"));
        let marker = BTreeMap::from([("prov/signed".to_string(), "true".to_string())]);

        client
            .patch_annotations_if_absent(&key, "prov/signed", marker.clone())
            .await
            .unwrap();
        let second = client
            .patch_annotations_if_absent(&key, "prov/signed", marker)
            .await;
        assert!(matches!(second, Err(Error::PreconditionConflict(_))));
        assert_eq!(client.patch_count(), 1);
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let client = InMemoryRunClient::new();
        let key = RunKey::new(RunKind::TaskRun, "builds", "ghost");
        assert!(matches!(
            client.get_run(&key).await,
            Err(Error::NotFound { .. })
        ));
    }
}
