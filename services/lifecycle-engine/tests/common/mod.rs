#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use caia_core::RetryConfig;
use lifecycle_engine::artifact_cache::{ArtifactLocation, ArtifactSource, ByteStream, CacheSettings};
use lifecycle_engine::runner::{EvalOutcome, EvalRequest};
use lifecycle_engine::{
    ArtifactCache, Engine, EngineError, EvalRunner, EvalSettings, MemoryRegistry, Model, Registry, Result,
};

pub const ONYX_URI: &str = "https://models.example/onyx-7.bin";
pub const ONYX_BYTES: &[u8] = b"onyx checkpoint weights, revision 7";

pub fn sha_of(bytes: &[u8]) -> String { hex::encode(Sha256::digest(bytes)) }

/// Serves artifact bytes from memory and counts every open.
#[derive(Default)]
pub struct MemorySource {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    endless: Mutex<Vec<String>>,
    opens: AtomicUsize,
    transient_failures: AtomicUsize,
    delay: Mutex<Duration>,
}

impl MemorySource {
    pub fn new() -> Self { Self::default() }

    pub fn put(&self, uri: &str, bytes: &[u8]) { self.objects.lock().insert(uri.to_string(), bytes.to_vec()); }

    /// The remote keeps sending bytes and never ends the body.
    pub fn put_endless(&self, uri: &str) { self.endless.lock().push(uri.to_string()); }

    pub fn opens(&self) -> usize { self.opens.load(Ordering::SeqCst) }

    pub fn fail_next(&self, n: usize) { self.transient_failures.store(n, Ordering::SeqCst); }

    pub fn set_delay(&self, d: Duration) { *self.delay.lock() = d; }
}

#[async_trait]
impl ArtifactSource for MemorySource {
    async fn open(&self, uri: &str, _location: &ArtifactLocation) -> Result<ByteStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() { tokio::time::sleep(delay).await; }
        let failing = self.transient_failures.load(Ordering::SeqCst);
        if failing > 0 {
            self.transient_failures.store(failing - 1, Ordering::SeqCst);
            return Err(EngineError::FetchFailed { artifact_uri: uri.into(), reason: "connection reset".into(), attempts: 1, retryable: true });
        }
        if self.endless.lock().iter().any(|u| u == uri) {
            return Ok(stream::repeat_with(|| Ok(Bytes::from_static(&[7u8; 8]))).boxed());
        }
        let bytes = self.objects.lock().get(uri).cloned().ok_or_else(|| EngineError::FetchFailed {
            artifact_uri: uri.into(),
            reason: "remote returned 404 Not Found".into(),
            attempts: 1,
            retryable: false,
        })?;
        let chunks: Vec<Result<Bytes>> = bytes.chunks(8).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        Ok(stream::iter(chunks).boxed())
    }
}

/// Returns scripted pass rates in order, then `fallback`.
pub struct ScriptedRunner {
    rates: Mutex<VecDeque<f64>>,
    fallback: f64,
    delay: Duration,
    calls: AtomicUsize,
    pub seen: Mutex<Vec<EvalRequest>>,
}

impl ScriptedRunner {
    pub fn passing(rate: f64) -> Self { Self::scripted(Vec::new(), rate) }

    pub fn scripted(rates: Vec<f64>, fallback: f64) -> Self {
        Self { rates: Mutex::new(rates.into()), fallback, delay: Duration::ZERO, calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl EvalRunner for ScriptedRunner {
    async fn run(&self, req: &EvalRequest) -> Result<EvalOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(req.clone());
        if !self.delay.is_zero() { tokio::time::sleep(self.delay).await; }
        let rate = self.rates.lock().pop_front().unwrap_or(self.fallback);
        let detail = format!("{}\n", json!({"prompt": "2+2", "passed": rate >= 0.5}));
        std::fs::write(req.runs_dir.join(format!("{}.jsonl", req.eval_run_id)), detail).map_err(|e| EngineError::storage("fake runner", e))?;
        let mut extra = Map::new();
        extra.insert("items".into(), json!(25));
        Ok(EvalOutcome { pass_rate: rate, score: Some(rate * 100.0), jsonl_path: None, summary_path: None, extra })
    }

    fn describe(&self) -> Value { json!({"kind": "scripted"}) }
}

pub fn model(id: i64, name: &str, status: &str) -> Model {
    serde_json::from_value(json!({
        "id": id,
        "name": name,
        "version": "1",
        "status": status,
        "artifact_uri": ONYX_URI,
        "checkpoint_sha256": sha_of(ONYX_BYTES),
        "checkpoint_size_bytes": ONYX_BYTES.len(),
        "metrics": {"loss": 1.25},
    }))
    .unwrap()
}

pub fn cache_settings(dir: &Path, max_bytes: u64) -> CacheSettings {
    CacheSettings {
        dir: dir.to_path_buf(),
        max_bytes,
        max_concurrent_fetches: 4,
        fetch_timeout: Duration::from_secs(5),
        retry: RetryConfig { max_retries: 2, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5), jitter: 0.0 },
        s3_endpoint: None,
    }
}

pub fn open_cache(dir: &Path, max_bytes: u64, source: Arc<MemorySource>) -> ArtifactCache {
    ArtifactCache::open(cache_settings(dir, max_bytes), source).unwrap()
}

pub struct Fixture {
    pub dir: TempDir,
    pub memory: Arc<MemoryRegistry>,
    pub source: Arc<MemorySource>,
    pub runner: Arc<ScriptedRunner>,
    pub engine: Arc<Engine>,
}

impl Fixture {
    pub fn new(runner: ScriptedRunner) -> Self { Self::with_registry(runner, |m| m as Arc<dyn Registry>) }

    /// `wrap` decides which registry the engine talks to; the plain memory
    /// registry stays reachable for assertions.
    pub fn with_registry(runner: ScriptedRunner, wrap: impl FnOnce(Arc<MemoryRegistry>) -> Arc<dyn Registry>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryRegistry::with_models([model(7, "onyx", "experimental")]));
        let source = Arc::new(MemorySource::new());
        source.put(ONYX_URI, ONYX_BYTES);
        let runner = Arc::new(runner);
        let cache = open_cache(&dir.path().join("cache"), 1 << 20, source.clone());
        let eval = EvalSettings {
            runs_dir: dir.path().join("runs"),
            inference_url: "http://127.0.0.1:8000".into(),
            allowed_suites: vec!["smoke-v1".into(), "core-v1".into(), "math-corpus-v1".into()],
            default_timeout: Duration::from_secs(5),
            default_max_tokens: None,
            default_temperature: None,
            default_request_timeout_secs: Some(30),
        };
        let engine = Arc::new(Engine::new(wrap(memory.clone()), cache, runner.clone(), eval).unwrap());
        Self { dir, memory, source, runner, engine }
    }

    pub async fn status(&self, id: i64) -> String {
        self.memory.get_model(id).await.unwrap().status.to_string()
    }
}
