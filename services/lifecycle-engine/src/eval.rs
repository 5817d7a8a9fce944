//! Runs one suite against one model and makes the result durable.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use caia_core::{KeyedExclusion, KeyedMutex};

use crate::artifact_cache::{write_atomic, ArtifactCache, ResolveRequest};
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::model::{EvalRun, ModelMetrics, SuiteResult};
use crate::registry::Registry;
use crate::runner::{EvalRequest, EvalRunner};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct EvalSettings {
    pub runs_dir: PathBuf,
    pub inference_url: String,
    pub allowed_suites: Vec<String>,
    pub default_timeout: Duration,
    pub default_max_tokens: Option<u32>,
    pub default_temperature: Option<f64>,
    /// Per inference request, handed to the runner. Unrelated to the run deadline.
    pub default_request_timeout_secs: Option<u64>,
}

/// Body of `POST /api/evals/run`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartEval {
    pub model_id: i64,
    pub suite: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Deadline for the whole run, artifact resolution included.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub inference_url: Option<String>,
}

impl StartEval {
    pub fn new(model_id: i64, suite: impl Into<String>) -> Self {
        Self { model_id, suite: suite.into(), ..Default::default() }
    }
}

pub struct EvalCoordinator {
    registry: Arc<dyn Registry>,
    cache: ArtifactCache,
    runner: Arc<dyn EvalRunner>,
    settings: EvalSettings,
    running: KeyedExclusion<i64>,
    metrics_locks: Arc<KeyedMutex<i64>>,
}

/// Client-supplied run ids become file names; refuse anything that could
/// leave the runs directory.
pub fn safe_run_id(raw: &str) -> Result<&str> {
    let id = raw.trim();
    if id.is_empty() { return Err(EngineError::bad_request("eval_run_id is required")); }
    if id.contains(['/', '\\', '\0']) { return Err(EngineError::bad_request("invalid eval_run_id")); }
    Ok(id)
}

impl EvalCoordinator {
    pub fn new(
        registry: Arc<dyn Registry>,
        cache: ArtifactCache,
        runner: Arc<dyn EvalRunner>,
        settings: EvalSettings,
        metrics_locks: Arc<KeyedMutex<i64>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&settings.runs_dir).map_err(|e| EngineError::storage("create eval runs dir", e))?;
        Ok(Self { registry, cache, runner, settings, running: KeyedExclusion::new(), metrics_locks })
    }

    pub fn settings(&self) -> &EvalSettings { &self.settings }

    pub fn runner(&self) -> &dyn EvalRunner { self.runner.as_ref() }

    pub fn is_running(&self, model_id: i64) -> bool { self.running.is_held(&model_id) }

    fn summary_path(&self, id: &str) -> PathBuf { self.settings.runs_dir.join(format!("{id}_summary.json")) }

    fn jsonl_path(&self, id: &str) -> PathBuf { self.settings.runs_dir.join(format!("{id}.jsonl")) }

    fn validate(&self, req: &StartEval) -> Result<String> {
        let suite = req.suite.trim();
        if suite.is_empty() { return Err(EngineError::bad_request("suite is required")); }
        if !self.settings.allowed_suites.iter().any(|s| s == suite) {
            return Err(EngineError::bad_request(format!("suite must be one of: {}", self.settings.allowed_suites.join(", "))));
        }
        if let Some(t) = req.temperature {
            if !t.is_finite() || t < 0.0 { return Err(EngineError::bad_request("temperature must be a non-negative number")); }
        }
        if req.timeout_seconds == Some(0) { return Err(EngineError::bad_request("timeout_seconds must be positive")); }
        if req.request_timeout_seconds == Some(0) { return Err(EngineError::bad_request("request_timeout_seconds must be positive")); }
        Ok(suite.to_string())
    }

    /// Blocks until the run is terminal. A second start for a model with a
    /// run in flight fails with `AlreadyRunning` instead of queueing.
    #[instrument(skip(self, req), fields(model_id = req.model_id, suite = %req.suite))]
    pub async fn start(&self, req: StartEval) -> Result<EvalRun> {
        let suite = self.validate(&req)?;
        let _running = self.running.try_acquire(req.model_id).ok_or(EngineError::AlreadyRunning { model_id: req.model_id })?;
        let started = Instant::now();
        let result = self.run_locked(&req, &suite).await;
        metrics::EVAL_DURATION.observe(started.elapsed().as_secs_f64());
        metrics::EVAL_RUNS.with_label_values(&[if result.is_ok() { "ok" } else { "error" }]).inc();
        result
    }

    /// One deadline covers resolution and the runner; each step gets whatever
    /// time is left.
    async fn run_locked(&self, req: &StartEval, suite: &str) -> Result<EvalRun> {
        let model_id = req.model_id;
        let timeout = req.timeout_seconds.map(Duration::from_secs).unwrap_or(self.settings.default_timeout);
        let deadline = Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let model = self.registry.get_model(model_id).await?;
        let uri = model.artifact_uri.as_deref().map(str::trim).filter(|u| !u.is_empty()).ok_or_else(|| {
            EngineError::ArtifactUnavailable { model_id, reason: "model has no artifact_uri".into(), cause: None }
        })?;

        let resolve = ResolveRequest::new(uri)
            .expect(model.checkpoint_sha256.clone(), model.checkpoint_size_bytes)
            .with_timeout(remaining());
        // held until the run finishes so eviction cannot pull the weights away
        let (artifact, _pin) = match self.cache.resolve_pinned(resolve).await {
            Ok(resolved) => resolved,
            Err(EngineError::Timeout { .. }) => {
                warn!(model_id, after_secs = timeout.as_secs(), "eval run timed out resolving its checkpoint");
                return Err(EngineError::Timeout { operation: format!("eval run for model {model_id}"), after_secs: timeout.as_secs() });
            }
            Err(e) => {
                warn!(model_id, error = %e, "artifact resolution failed, eval aborted");
                return Err(EngineError::ArtifactUnavailable { model_id, reason: e.to_string(), cause: Some(Box::new(e)) });
            }
        };

        let eval_run_id = Uuid::new_v4().to_string();
        let run_req = EvalRequest {
            eval_run_id: eval_run_id.clone(),
            model_id,
            suite: suite.to_string(),
            checkpoint_path: artifact.local_path.clone(),
            inference_url: req.inference_url.clone().filter(|u| !u.trim().is_empty()).unwrap_or_else(|| self.settings.inference_url.clone()),
            runs_dir: self.settings.runs_dir.clone(),
            max_tokens: req.max_tokens.or(self.settings.default_max_tokens),
            temperature: req.temperature.or(self.settings.default_temperature),
            request_timeout_secs: req.request_timeout_seconds.or(self.settings.default_request_timeout_secs),
        };

        let started_at = Utc::now();
        info!(model_id, suite, eval_run_id = %eval_run_id, checkpoint = %artifact.local_path.display(), "eval run started");
        let outcome = match tokio::time::timeout(remaining(), self.runner.run(&run_req)).await {
            Ok(r) => r?,
            Err(_) => {
                warn!(model_id, eval_run_id = %eval_run_id, after_secs = timeout.as_secs(), "eval run timed out");
                return Err(EngineError::Timeout { operation: format!("eval run {eval_run_id}"), after_secs: timeout.as_secs() });
            }
        };
        let finished_at = Utc::now();

        let mut run = EvalRun {
            eval_run_id: eval_run_id.clone(),
            model_id,
            suite: suite.to_string(),
            pass_rate: outcome.pass_rate,
            score: outcome.score,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            jsonl_path: Some(outcome.jsonl_path.clone().unwrap_or_else(|| self.jsonl_path(&eval_run_id))),
            summary_path: Some(self.summary_path(&eval_run_id)),
            extra: outcome.extra.clone(),
        };
        self.write_summary(&mut run, outcome.summary_path.as_deref()).await?;

        let result = SuiteResult {
            pass_rate: run.pass_rate,
            score: run.score,
            eval_run_id: Some(eval_run_id.clone()),
            finished_at: Some(finished_at),
        };
        // a summary without its metrics entry would list a run the model never saw
        if let Err(e) = self.record_suite_result(model_id, suite, &result).await {
            warn!(model_id, eval_run_id = %eval_run_id, error = %e, "metrics write failed, withdrawing run summary");
            if let Err(rm) = tokio::fs::remove_file(self.summary_path(&eval_run_id)).await {
                warn!(eval_run_id = %eval_run_id, error = %rm, "failed to remove run summary");
            }
            return Err(e);
        }
        info!(model_id, suite, eval_run_id = %eval_run_id, pass_rate = run.pass_rate, "eval run finished");
        Ok(run)
    }

    /// Merge the run fields over whatever summary the runner produced and
    /// rewrite the canonical summary file atomically.
    async fn write_summary(&self, run: &mut EvalRun, runner_summary: Option<&Path>) -> Result<()> {
        let canonical = self.summary_path(&run.eval_run_id);
        let source = runner_summary.map(Path::to_path_buf).unwrap_or_else(|| canonical.clone());
        let mut merged: Map<String, Value> = match tokio::fs::read(&source).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(Value::Object(obj)) => obj,
                _ => Map::new(),
            },
            Err(_) => Map::new(),
        };
        for (k, v) in std::mem::take(&mut run.extra) {
            merged.entry(k).or_insert(v);
        }
        let own = serde_json::to_value(&*run).map_err(|e| EngineError::storage("encode eval summary", e))?;
        if let Value::Object(fields) = own {
            for (k, v) in fields { merged.insert(k, v); }
        }
        let bytes = serde_json::to_vec_pretty(&Value::Object(merged.clone())).map_err(|e| EngineError::storage("encode eval summary", e))?;
        let dir = self.settings.runs_dir.clone();
        let name = format!("{}_summary.json", run.eval_run_id);
        tokio::task::spawn_blocking(move || write_atomic(&dir, &name, &bytes))
            .await
            .map_err(|e| EngineError::storage("summary writer", e))??;

        let known = ["eval_run_id", "model_id", "suite", "pass_rate", "score", "started_at", "finished_at", "jsonl_path", "summary_path"];
        run.extra = merged.into_iter().filter(|(k, _)| !known.contains(&k.as_str())).collect();
        Ok(())
    }

    /// Read-modify-write of `metrics.suites[suite]` under the per-model lock
    /// shared with every other metrics writer.
    pub async fn record_suite_result(&self, model_id: i64, suite: &str, result: &SuiteResult) -> Result<()> {
        result.validate()?;
        let _guard = self.metrics_locks.lock(model_id).await;
        let mut metrics = self.registry.get_metrics(model_id).await?;
        ModelMetrics::set_suite(&mut metrics, suite, result)?;
        self.registry.put_metrics(model_id, metrics).await?;
        debug!(model_id, suite, "suite result recorded");
        Ok(())
    }

    /// Newest first by summary modification time.
    pub async fn list(&self, model_id: Option<i64>, limit: Option<usize>) -> Result<Vec<EvalRun>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let mut summaries: Vec<(SystemTime, PathBuf)> = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.settings.runs_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::storage("read eval runs dir", e)),
        };
        while let Some(entry) = dir.next_entry().await.map_err(|e| EngineError::storage("read eval runs dir", e))? {
            let path = entry.path();
            if !path.file_name().and_then(|n| n.to_str()).map(|n| n.ends_with("_summary.json")).unwrap_or(false) { continue; }
            let Ok(meta) = entry.metadata().await else { continue };
            summaries.push((meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), path));
        }
        summaries.sort_by(|a, b| b.0.cmp(&a.0));

        let mut out = Vec::new();
        for (_, path) in summaries {
            if out.len() >= limit { break; }
            let Ok(raw) = tokio::fs::read(&path).await else { continue };
            let mut run: EvalRun = match serde_json::from_slice(&raw) {
                Ok(r) => r,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable summary");
                    continue;
                }
            };
            if model_id.map(|id| id != run.model_id).unwrap_or(false) { continue; }
            run.summary_path.get_or_insert(path);
            out.push(run);
        }
        Ok(out)
    }

    pub async fn get_summary(&self, eval_run_id: &str) -> Result<Value> {
        let id = safe_run_id(eval_run_id)?;
        let raw = match tokio::fs::read(self.summary_path(id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(EngineError::not_found(format!("eval summary {id}"))),
            Err(e) => return Err(EngineError::storage("read eval summary", e)),
        };
        serde_json::from_slice(&raw).map_err(|e| EngineError::storage("decode eval summary", e))
    }

    /// Open the line-delimited detail log. The location recorded in the
    /// summary wins over the default `<id>.jsonl`.
    pub async fn detail_stream(&self, eval_run_id: &str) -> Result<tokio::fs::File> {
        let id = safe_run_id(eval_run_id)?;
        let recorded = match tokio::fs::read(self.summary_path(id)).await {
            Ok(raw) => serde_json::from_slice::<Value>(&raw)
                .ok()
                .and_then(|v| v.get("jsonl_path").and_then(Value::as_str).map(PathBuf::from)),
            Err(_) => None,
        };
        let path = recorded.unwrap_or_else(|| self.jsonl_path(id));
        tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::not_found(format!("eval jsonl {id}")),
            _ => EngineError::storage("open eval jsonl", e),
        })
    }
}
