//! End-to-end reconcile tests against the in-memory orchestrator.

use async_trait::async_trait;
use buildseal_common::formats::PayloadFormat;
use buildseal_common::types::{
    Condition, ConditionStatus, ObjectMeta, Param, RunResult, StepState, StepTermination, TaskRun,
    TaskRunStatus,
};
use buildseal_common::{EngineConfig, Envelope, KeyAlgorithm, KeyPair, RunObject, TrustBundle};
use buildseal_daemon::cluster::{InMemoryRunClient, RunClient, RunKey};
use buildseal_daemon::reconciler::{Reconciler, ReconcilerOptions};
use buildseal_daemon::storage::annotation::AnnotationBackend;
use buildseal_daemon::storage::objectstore::ObjectStoreBackend;
use buildseal_daemon::storage::{Backend, StorePayload};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn image_task_run(name: &str) -> TaskRun {
    TaskRun {
        meta: ObjectMeta {
            name: name.into(),
            namespace: "builds".into(),
            uid: format!("uid-{name}"),
            ..Default::default()
        },
        spec: buildseal_common::types::TaskRunSpec {
            params: vec![
                Param::new("CHAINS-GIT_URL", "https://git.x/y"),
                Param::new("CHAINS-GIT_COMMIT", "abcd"),
            ],
            ..Default::default()
        },
        status: TaskRunStatus {
            start_time: Some("2024-03-01T10:00:00Z".parse().unwrap()),
            completion_time: Some("2024-03-01T10:05:00Z".parse().unwrap()),
            conditions: vec![Condition::succeeded(ConditionStatus::True)],
            steps: vec![StepState {
                name: "build".into(),
                image_id: "docker://docker.io/base@sha256:bbbb".into(),
                results: vec![],
                terminated: Some(StepTermination { exit_code: 0 }),
            }],
            results: vec![
                RunResult::new("IMAGE_URL", "reg.example/img"),
                RunResult::new("IMAGE_DIGEST", "sha256:aaaa"),
            ],
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Harness {
    client: Arc<InMemoryRunClient>,
    reconciler: Arc<Reconciler>,
    key: KeyPair,
    store: TempDir,
}

fn harness(engine: EngineConfig) -> Harness {
    let client = Arc::new(InMemoryRunClient::new());
    let store = TempDir::new().unwrap();
    let key = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
    let backends: Vec<Box<dyn Backend>> = vec![
        Box::new(AnnotationBackend::new(client.clone(), engine.clone())),
        Box::new(ObjectStoreBackend::new(
            store.path().to_path_buf(),
            "attestations".into(),
        )),
    ];
    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        backends,
        engine,
        ReconcilerOptions {
            base_backoff: std::time::Duration::from_millis(10),
            max_backoff: std::time::Duration::from_millis(50),
            ..Default::default()
        },
        key.clone(),
    ));
    Harness {
        client,
        reconciler,
        key,
        store,
    }
}

fn stored_files(store: &TempDir) -> Vec<String> {
    let dir = store.path().join("attestations");
    if !dir.exists() {
        return Vec::new();
    }
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn sign_store_and_mark() {
    let h = harness(EngineConfig::default());
    let key = h
        .client
        .insert(RunObject::Task(image_task_run("build")));

    h.reconciler.reconcile(&key).await.unwrap();

    let run = h.client.get_run(&key).await.unwrap();
    assert_eq!(
        run.annotations().get("buildseal.dev/signed").map(String::as_str),
        Some("true")
    );

    // The annotation backend stored the envelope; it must verify against
    // the key that signed it.
    let envelope_json = run
        .annotations()
        .get("buildseal.dev/slsa-1.0-signature")
        .expect("signature annotation");
    let envelope: Envelope = serde_json::from_str(envelope_json).unwrap();
    envelope.verify(&h.key.public_key_der().unwrap()).unwrap();

    // The statement inside names the built image.
    let payload: serde_json::Value =
        serde_json::from_slice(&envelope.payload_bytes().unwrap()).unwrap();
    assert_eq!(payload["subject"][0]["name"], "reg.example/img");
    assert_eq!(payload["subject"][0]["digest"]["sha256"], "aaaa");

    assert_eq!(
        stored_files(&h.store),
        vec![
            "taskrun-builds-build.slsa-1.0.payload".to_string(),
            "taskrun-builds-build.slsa-1.0.signature".to_string(),
        ]
    );
}

#[tokio::test]
async fn replay_of_signed_run_is_noop() {
    let h = harness(EngineConfig::default());
    let key = h
        .client
        .insert(RunObject::Task(image_task_run("build")));

    h.reconciler.reconcile(&key).await.unwrap();
    let patches_after_first = h.client.patch_count();
    let files_after_first = stored_files(&h.store);

    h.reconciler.reconcile(&key).await.unwrap();

    assert_eq!(h.client.patch_count(), patches_after_first);
    assert_eq!(stored_files(&h.store), files_after_first);
    assert_eq!(
        h.reconciler
            .metrics()
            .already_signed
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn non_terminal_run_is_skipped() {
    let h = harness(EngineConfig::default());
    let mut tr = image_task_run("running");
    tr.status.conditions = vec![Condition::succeeded(ConditionStatus::Unknown)];
    let key = h.client.insert(RunObject::Task(tr));

    h.reconciler.reconcile(&key).await.unwrap();

    assert_eq!(h.client.patch_count(), 0);
    assert!(stored_files(&h.store).is_empty());
}

#[tokio::test]
async fn failed_run_is_not_attested() {
    let h = harness(EngineConfig::default());
    let mut tr = image_task_run("broken");
    tr.status.conditions = vec![Condition::succeeded(ConditionStatus::False)];
    let key = h.client.insert(RunObject::Task(tr));

    h.reconciler.reconcile(&key).await.unwrap();

    assert_eq!(h.client.patch_count(), 0);
    assert!(stored_files(&h.store).is_empty());
}

#[tokio::test]
async fn missing_result_signature_blocks_signing() {
    let ca_key = rcgen_ca();
    let h = harness(EngineConfig::default());
    let reconciler = Arc::new(
        Reconciler::new(
            h.client.clone(),
            vec![Box::new(AnnotationBackend::new(
                h.client.clone(),
                EngineConfig::default(),
            )) as Box<dyn Backend>],
            EngineConfig::default(),
            ReconcilerOptions::default(),
            h.key.clone(),
        )
        .with_trust_bundle(ca_key.bundle),
    );

    let mut tr = image_task_run("unattested");
    tr.status.results.push(RunResult::new("SVID", ca_key.leaf_pem.as_str()));
    tr.status.results.push(RunResult::new("result1", "value"));
    let key = h.client.insert(RunObject::Task(tr));

    reconciler.reconcile(&key).await.unwrap();

    let run = h.client.get_run(&key).await.unwrap();
    assert_eq!(
        run.annotations()
            .get("buildseal.dev/failed-verification")
            .map(String::as_str),
        Some("true")
    );
    assert!(!run.annotations().contains_key("buildseal.dev/signed"));
    assert_eq!(
        reconciler
            .metrics()
            .verification_failures
            .load(Ordering::Relaxed),
        1
    );

    // The rejection is permanent: replay stays a no-op.
    reconciler.reconcile(&key).await.unwrap();
    assert!(!h
        .client
        .get_run(&key)
        .await
        .unwrap()
        .annotations()
        .contains_key("buildseal.dev/signed"));
}

struct IssuedCa {
    bundle: TrustBundle,
    leaf_pem: String,
}

fn rcgen_ca() -> IssuedCa {
    let ca_key = rcgen::KeyPair::generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::new(vec![]).unwrap();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = rcgen::KeyPair::generate().unwrap();
    let leaf_params = rcgen::CertificateParams::new(vec!["run.builds.svc".to_string()]).unwrap();
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    IssuedCa {
        bundle: TrustBundle::from_pem(&ca_cert.pem()).unwrap(),
        leaf_pem: leaf_cert.pem(),
    }
}

#[tokio::test]
async fn payload_bytes_identical_across_writers() {
    let engine = EngineConfig::default();
    let first = harness(engine.clone());
    let second = harness(engine);

    let key_a = first
        .client
        .insert(RunObject::Task(image_task_run("build")));
    let key_b = second
        .client
        .insert(RunObject::Task(image_task_run("build")));

    first.reconciler.reconcile(&key_a).await.unwrap();
    second.reconciler.reconcile(&key_b).await.unwrap();

    let payload_name = "taskrun-builds-build.slsa-1.0.payload";
    let bytes_a =
        std::fs::read(first.store.path().join("attestations").join(payload_name)).unwrap();
    let bytes_b =
        std::fs::read(second.store.path().join("attestations").join(payload_name)).unwrap();
    assert_eq!(bytes_a, bytes_b);
}

#[tokio::test]
async fn simplesigning_stores_per_subject() {
    let engine = EngineConfig {
        payload_formats: vec![PayloadFormat::SimpleSigning],
        ..Default::default()
    };
    let h = harness(engine);
    let key = h
        .client
        .insert(RunObject::Task(image_task_run("build")));

    h.reconciler.reconcile(&key).await.unwrap();

    assert_eq!(
        stored_files(&h.store),
        vec![
            "reg.example-img-sha256-aaaa.simplesigning.payload".to_string(),
            "reg.example-img-sha256-aaaa.simplesigning.signature".to_string(),
        ]
    );
}

/// A backend that fails a fixed number of times before succeeding.
struct FlakyBackend {
    failures_left: AtomicU32,
}

#[async_trait]
impl Backend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn store(&self, _run: &RunObject, _item: &StorePayload) -> buildseal_common::Result<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(buildseal_common::Error::Storage {
                backend: "flaky".into(),
                message: "transient outage".into(),
            });
        }
        Ok(())
    }
}

#[tokio::test]
async fn transient_storage_failure_retries_until_marked() {
    let client = Arc::new(InMemoryRunClient::new());
    let engine = EngineConfig::default();
    let backends: Vec<Box<dyn Backend>> = vec![
        Box::new(FlakyBackend {
            failures_left: AtomicU32::new(2),
        }),
        Box::new(AnnotationBackend::new(client.clone(), engine.clone())),
    ];
    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        backends,
        engine,
        ReconcilerOptions {
            workers: 2,
            base_backoff: std::time::Duration::from_millis(5),
            max_backoff: std::time::Duration::from_millis(20),
            ..Default::default()
        },
        KeyPair::generate(KeyAlgorithm::Ed25519).unwrap(),
    ));

    let key = client.insert(RunObject::Task(image_task_run("build")));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_handle = tokio::spawn(reconciler.clone().run(shutdown_rx));

    reconciler.enqueue(key.clone());

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let run = client.get_run(&key).await.unwrap();
        if run.annotations().contains_key("buildseal.dev/signed") {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "run was never marked signed"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert!(reconciler.metrics().transient_retries.load(Ordering::Relaxed) >= 1);
    let _ = shutdown_tx.send(true);
    let _ = run_handle.await;
}

#[tokio::test]
async fn resync_enqueues_known_runs() {
    let h = harness(EngineConfig::default());
    h.client.insert(RunObject::Task(image_task_run("one")));
    h.client.insert(RunObject::Task(image_task_run("two")));

    let enqueued = h.reconciler.resync().await.unwrap();
    assert_eq!(enqueued, 2);
    // Same keys are already queued, so a second resync adds nothing.
    assert_eq!(h.reconciler.resync().await.unwrap(), 0);
}
