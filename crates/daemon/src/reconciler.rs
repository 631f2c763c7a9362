//! Reconciliation loop
//!
//! Drives terminal build runs through the signing lifecycle exactly once:
//! observe, verify identity, generate payloads, sign, store, mark. The
//! `signed` annotation is the single-writer token; storage is therefore
//! at-least-once and payload bytes are deterministic so concurrent
//! writers overwrite benignly.

use crate::cluster::{RunClient, RunKey};
use crate::storage::{Backend, StorePayload};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use buildseal_common::formats::{generate_payloads, PayloadFormat, RunView};
use buildseal_common::svid;
use buildseal_common::{EngineConfig, Envelope, Error, KeyPair, Result, TimestampAuthority, TrustBundle};
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Reconciler tuning knobs
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub reconcile_timeout: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            reconcile_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&crate::config::ReconcilerConfig> for ReconcilerOptions {
    fn from(config: &crate::config::ReconcilerConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_attempts: config.max_attempts.max(1),
            reconcile_timeout: config.reconcile_timeout(),
            ..Default::default()
        }
    }
}

/// Per-error-kind counters, surfaced in logs on shutdown
#[derive(Debug, Default)]
pub struct Metrics {
    pub signed: AtomicU64,
    pub already_signed: AtomicU64,
    pub verification_failures: AtomicU64,
    pub transient_retries: AtomicU64,
    pub permanent_failures: AtomicU64,
    pub conflicts: AtomicU64,
}

impl Metrics {
    pub fn log_summary(&self) {
        info!(
            signed = self.signed.load(Ordering::Relaxed),
            already_signed = self.already_signed.load(Ordering::Relaxed),
            verification_failures = self.verification_failures.load(Ordering::Relaxed),
            transient_retries = self.transient_retries.load(Ordering::Relaxed),
            permanent_failures = self.permanent_failures.load(Ordering::Relaxed),
            conflicts = self.conflicts.load(Ordering::Relaxed),
            "reconciler counters"
        );
    }
}

/// Bounded, non-authoritative memory of signed run uids so repeated
/// observations of a marked run log once.
struct RecentlySigned {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentlySigned {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns true when the uid was not yet remembered.
    fn insert(&mut self, uid: &str) -> bool {
        if !self.set.insert(uid.to_string()) {
            return false;
        }
        self.order.push_back(uid.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

/// De-duplicating work queue of run keys
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<RunKey>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RunKey>>,
    queued: DashSet<String>,
    processing: DashSet<String>,
}

impl WorkQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            queued: DashSet::new(),
            processing: DashSet::new(),
        }
    }

    /// Enqueue a key unless it is already waiting.
    pub fn enqueue(&self, key: RunKey) -> bool {
        if !self.queued.insert(key.to_string()) {
            return false;
        }
        self.tx.send(key).is_ok()
    }

    async fn recv(&self) -> Option<RunKey> {
        let key = self.rx.lock().await.recv().await?;
        self.queued.remove(&key.to_string());
        Some(key)
    }
}

/// The reconciler: worker pool plus the per-run signing state machine
pub struct Reconciler {
    client: Arc<dyn RunClient>,
    backends: Vec<Box<dyn Backend>>,
    engine: EngineConfig,
    opts: ReconcilerOptions,
    signing_key: RwLock<Arc<KeyPair>>,
    trust_bundle: RwLock<Option<Arc<TrustBundle>>>,
    timestamper: Option<Box<dyn TimestampAuthority>>,
    queue: WorkQueue,
    metrics: Metrics,
    recently_signed: Mutex<RecentlySigned>,
    attempts: DashMap<String, u32>,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn RunClient>,
        backends: Vec<Box<dyn Backend>>,
        engine: EngineConfig,
        opts: ReconcilerOptions,
        signing_key: KeyPair,
    ) -> Self {
        Self {
            client,
            backends,
            engine,
            opts,
            signing_key: RwLock::new(Arc::new(signing_key)),
            trust_bundle: RwLock::new(None),
            timestamper: None,
            queue: WorkQueue::new(),
            metrics: Metrics::default(),
            recently_signed: Mutex::new(RecentlySigned::new(256)),
            attempts: DashMap::new(),
        }
    }

    pub fn with_trust_bundle(mut self, bundle: TrustBundle) -> Self {
        self.trust_bundle = RwLock::new(Some(Arc::new(bundle)));
        self
    }

    pub fn with_timestamper(mut self, timestamper: Box<dyn TimestampAuthority>) -> Self {
        self.timestamper = Some(timestamper);
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Swap the signing key; used by the reload signal handler.
    pub fn swap_signing_key(&self, key: KeyPair) {
        *self.signing_key.write() = Arc::new(key);
        info!("signing key reloaded");
    }

    /// Swap the trust bundle; used by the reload signal handler.
    pub fn swap_trust_bundle(&self, bundle: Option<TrustBundle>) {
        *self.trust_bundle.write() = bundle.map(Arc::new);
        info!("trust bundle reloaded");
    }

    pub fn enqueue(&self, key: RunKey) {
        self.queue.enqueue(key);
    }

    /// Enqueue every run the orchestrator knows about.
    pub async fn resync(&self) -> Result<usize> {
        let keys = self.client.list_runs().await?;
        let mut enqueued = 0;
        for key in keys {
            if self.queue.enqueue(key) {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Run the worker pool until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(workers = self.opts.workers, "reconciler started");
        let mut handles = Vec::with_capacity(self.opts.workers);
        for worker_id in 0..self.opts.workers {
            let reconciler = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(reconciler.worker(worker_id, shutdown)));
        }
        for handle in handles {
            let _ = handle.await;
        }
        self.metrics.log_summary();
        info!("reconciler stopped");
    }

    async fn worker(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            let key = tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                key = self.queue.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            // At most one worker per key: a key already being processed
            // goes back to the queue after a short pause.
            if !self.queue.processing.insert(key.to_string()) {
                let reconciler = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    reconciler.queue.enqueue(key);
                });
                continue;
            }
            debug!(worker = worker_id, run = %key, "reconciling");
            self.process(&key).await;
            self.queue.processing.remove(&key.to_string());
        }
    }

    /// One attempt with retry classification and backoff requeue.
    async fn process(&self, key: &RunKey) {
        let outcome = tokio::time::timeout(self.opts.reconcile_timeout, self.reconcile(key)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                seconds: self.opts.reconcile_timeout.as_secs(),
            }),
        };

        match result {
            Ok(()) => {
                self.attempts.remove(&key.to_string());
            }
            Err(e) if e.is_transient() => {
                let attempt = {
                    let mut entry = self.attempts.entry(key.to_string()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempt >= self.opts.max_attempts {
                    error!(run = %key, attempts = attempt, "giving up after transient failures: {}", e);
                    self.metrics.permanent_failures.fetch_add(1, Ordering::Relaxed);
                    self.attempts.remove(&key.to_string());
                    return;
                }
                let delay = self.backoff(attempt);
                warn!(run = %key, attempt, delay_ms = delay.as_millis() as u64, "requeueing after transient failure: {}", e);
                self.metrics.transient_retries.fetch_add(1, Ordering::Relaxed);
                // The key is marked queued before the delay so duplicate
                // events arriving meanwhile collapse into this retry.
                if self.queue.queued.insert(key.to_string()) {
                    let tx = self.queue.tx.clone();
                    let key = key.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(key);
                    });
                }
            }
            Err(e) => {
                error!(run = %key, "permanent reconcile failure: {}", e);
                self.metrics.permanent_failures.fetch_add(1, Ordering::Relaxed);
                self.attempts.remove(&key.to_string());
            }
        }
    }

    /// Exponential backoff with ±10% jitter, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .opts
            .base_backoff
            .saturating_mul(1u32 << (attempt - 1).min(16))
            .min(self.opts.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        exp.mul_f64(jitter)
    }

    /// The signing state machine for one run.
    pub async fn reconcile(&self, key: &RunKey) -> Result<()> {
        let run = self.client.get_run(key).await?;

        if !run.is_terminal() {
            debug!(run = %key, "run not terminal yet");
            return Ok(());
        }

        let signed_annotation = self.engine.signed_annotation();
        if run.annotations().contains_key(&signed_annotation) {
            self.metrics.already_signed.fetch_add(1, Ordering::Relaxed);
            if self.recently_signed.lock().insert(run.uid()) {
                debug!(run = %key, uid = run.uid(), "already signed");
            }
            return Ok(());
        }
        if run
            .annotations()
            .contains_key(&self.engine.failed_verification_annotation())
        {
            debug!(run = %key, "previously failed verification");
            return Ok(());
        }

        if !run.is_successful() {
            debug!(run = %key, "run did not succeed, nothing to attest");
            return Ok(());
        }

        let trust_bundle = self.trust_bundle.read().clone();
        if let Some(bundle) = trust_bundle {
            if let Err(e) = svid::verify_run_results(&run, &bundle) {
                warn!(run = %key, uid = run.uid(), "identity verification failed: {}", e);
                self.metrics
                    .verification_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.client
                    .patch_annotations(
                        key,
                        BTreeMap::from([(
                            self.engine.failed_verification_annotation(),
                            "true".to_string(),
                        )]),
                    )
                    .await?;
                return Ok(());
            }
        }

        let items = self.generate_and_sign(&run).await?;

        let mut first_error = None;
        for backend in &self.backends {
            for item in &items {
                if let Err(e) = backend.store(&run, item).await {
                    warn!(run = %key, backend = backend.name(), "storage failed: {}", e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        match self
            .client
            .patch_annotations_if_absent(
                key,
                &signed_annotation,
                BTreeMap::from([(signed_annotation.clone(), "true".to_string())]),
            )
            .await
        {
            Ok(()) => {
                self.metrics.signed.fetch_add(1, Ordering::Relaxed);
                self.recently_signed.lock().insert(run.uid());
                info!(run = %key, uid = run.uid(), payloads = items.len(), "run signed and marked");
                Ok(())
            }
            Err(Error::PreconditionConflict(_)) => {
                self.metrics.conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(run = %key, "another writer marked the run first");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Generate every configured payload and wrap each in a signed
    /// envelope, countersigning when a timestamp authority is configured.
    async fn generate_and_sign(
        &self,
        run: &buildseal_common::RunObject,
    ) -> Result<Vec<StorePayload>> {
        let view = RunView::new(run, &self.engine);
        let signing_key = self.signing_key.read().clone();

        let mut items = Vec::new();
        for format in &self.engine.payload_formats {
            for payload in generate_payloads(*format, &view)? {
                let bytes = serde_json::to_vec(&payload.body)?;
                let mut envelope = Envelope::sign(&signing_key, format.payload_type(), &bytes)?;

                if let Some(timestamper) = &self.timestamper {
                    let signature = envelope
                        .primary_signature()
                        .map(|s| BASE64.decode(s))
                        .transpose()?
                        .unwrap_or_default();
                    match timestamper.countersign(&signature).await {
                        Ok(token) => envelope.add_timestamp(&token),
                        Err(e) if self.engine.timestamp_required => {
                            return Err(Error::Signing(format!("timestamp required: {e}")));
                        }
                        Err(e) => warn!(run = run.uid(), "timestamp skipped: {}", e),
                    }
                }

                let signature = match format {
                    PayloadFormat::SimpleSigning => envelope
                        .primary_signature()
                        .unwrap_or_default()
                        .to_string(),
                    _ => serde_json::to_string(&envelope)?,
                };
                items.push(StorePayload {
                    format: *format,
                    payload: bytes,
                    signature,
                    full_key: payload.full_key,
                });
            }
        }
        Ok(items)
    }
}
