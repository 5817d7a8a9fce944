//! The external eval-suite runner. Scoring happens elsewhere; the engine
//! only needs start/await and where the output files landed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, instrument};

use crate::error::{EngineError, Result};

const STDERR_TAIL: usize = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct EvalRequest {
    pub eval_run_id: String,
    pub model_id: i64,
    pub suite: String,
    pub checkpoint_path: PathBuf,
    pub inference_url: String,
    pub runs_dir: PathBuf,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// Bound on each inference call the runner makes, not on the run.
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvalOutcome {
    pub pass_rate: f64,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,
    #[serde(default)]
    pub summary_path: Option<PathBuf>,
    /// Anything else the runner reported, kept for the summary file.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[async_trait]
pub trait EvalRunner: Send + Sync {
    async fn run(&self, req: &EvalRequest) -> Result<EvalOutcome>;

    fn describe(&self) -> Value;
}

/// Spawns the runner program once per eval. The child is killed if the
/// awaiting future is dropped, which is how a timeout cancels it.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self { program: program.into(), args, working_dir }
    }

    fn command_args(&self, req: &EvalRequest) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "--suite".to_string(), req.suite.clone(),
            "--model-id".to_string(), req.model_id.to_string(),
            "--checkpoint-path".to_string(), req.checkpoint_path.display().to_string(),
            "--inference-url".to_string(), req.inference_url.clone(),
            "--eval-run-id".to_string(), req.eval_run_id.clone(),
            "--eval-runs-dir".to_string(), req.runs_dir.display().to_string(),
        ]);
        if let Some(v) = req.max_tokens { args.extend(["--max-tokens".to_string(), v.to_string()]); }
        if let Some(v) = req.temperature { args.extend(["--temperature".to_string(), v.to_string()]); }
        if let Some(v) = req.request_timeout_secs { args.extend(["--timeout-seconds".to_string(), v.to_string()]); }
        args
    }
}

fn tail(s: &str) -> String {
    let s = s.trim();
    if s.len() <= STDERR_TAIL { return s.to_string(); }
    let mut start = s.len() - STDERR_TAIL;
    while !s.is_char_boundary(start) { start += 1; }
    s[start..].to_string()
}

/// Runner stdout must be one JSON object with at least `pass_rate`.
pub fn parse_outcome(stdout: &str) -> Result<EvalOutcome> {
    let value: Value = serde_json::from_str(stdout.trim()).map_err(|e| EngineError::EvalRunner {
        exit_code: Some(0),
        detail: format!("invalid JSON on stdout: {e}: {}", tail(stdout)),
    })?;
    if !value.is_object() {
        return Err(EngineError::EvalRunner { exit_code: Some(0), detail: "runner output is not a JSON object".into() });
    }
    let outcome: EvalOutcome = serde_json::from_value(value)
        .map_err(|e| EngineError::EvalRunner { exit_code: Some(0), detail: format!("runner output missing fields: {e}") })?;
    if !outcome.pass_rate.is_finite() || !(0.0..=1.0).contains(&outcome.pass_rate) {
        return Err(EngineError::EvalRunner { exit_code: Some(0), detail: format!("pass_rate {} outside [0, 1]", outcome.pass_rate) });
    }
    Ok(outcome)
}

#[async_trait]
impl EvalRunner for ProcessRunner {
    #[instrument(skip(self, req), fields(eval_run_id = %req.eval_run_id, model_id = req.model_id, suite = %req.suite))]
    async fn run(&self, req: &EvalRequest) -> Result<EvalOutcome> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.command_args(req))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir { cmd.current_dir(dir); }
        debug!(program = %self.program, "spawning eval runner");

        let child = cmd.spawn().map_err(|e| EngineError::EvalRunner {
            exit_code: None,
            detail: format!("failed to spawn {}: {e}", self.program),
        })?;
        let output = child.wait_with_output().await.map_err(|e| EngineError::EvalRunner { exit_code: None, detail: e.to_string() })?;
        if !output.status.success() {
            return Err(EngineError::EvalRunner {
                exit_code: output.status.code(),
                detail: tail(&String::from_utf8_lossy(&output.stderr)),
            });
        }
        parse_outcome(&String::from_utf8_lossy(&output.stdout))
    }

    fn describe(&self) -> Value {
        json!({"kind": "process", "program": self.program, "args": self.args, "working_dir": self.working_dir})
    }
}
