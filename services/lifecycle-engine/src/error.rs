use serde_json::{json, Value};
use thiserror::Error;

use crate::model::ModelStatus;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Every failure the engine surfaces. Variants carry the measured values a
/// caller needs to render an actionable message without re-querying.
///
/// `Clone` so a single-flight fetch can hand one result to every waiter.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("model {model_id}: cannot transition {from} -> {to}: {reason}")]
    InvalidTransition { model_id: i64, from: ModelStatus, to: ModelStatus, reason: String },

    #[error("model {model_id} has another promotion operation in flight")]
    Busy { model_id: i64 },

    #[error("gate failed for model {model_id} on suite {suite}: pass rate {measured} < threshold {threshold}")]
    GateFailed { model_id: i64, suite: String, measured: f64, threshold: f64, eval_run_id: String },

    #[error("artifact unavailable for model {model_id}: {reason}")]
    ArtifactUnavailable { model_id: i64, reason: String, cause: Option<Box<EngineError>> },

    #[error("integrity mismatch for {artifact_uri}: expected sha256 {} size {}, got sha256 {actual_sha256} size {actual_size}",
        .expected_sha256.as_deref().unwrap_or("<any>"),
        .expected_size.map(|s| s.to_string()).unwrap_or_else(|| "<any>".into()))]
    IntegrityMismatch {
        artifact_uri: String,
        expected_sha256: Option<String>,
        actual_sha256: String,
        expected_size: Option<u64>,
        actual_size: u64,
    },

    #[error("fetch failed for {artifact_uri} after {attempts} attempt(s): {reason}")]
    FetchFailed { artifact_uri: String, reason: String, attempts: usize, retryable: bool },

    #[error("artifact cache storage error: {reason}")]
    CacheStorageError { reason: String },

    #[error("an eval run is already in progress for model {model_id}")]
    AlreadyRunning { model_id: i64 },

    #[error("{operation} timed out after {after_secs}s")]
    Timeout { operation: String, after_secs: u64 },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("bad request: {message}")]
    BadRequest { message: String },

    #[error("model-registry error: {detail}")]
    Registry { status: Option<u16>, detail: Value },

    #[error("eval runner failed: {detail}")]
    EvalRunner { exit_code: Option<i32>, detail: String },
}

impl EngineError {
    pub fn bad_request(message: impl Into<String>) -> Self { Self::BadRequest { message: message.into() } }

    pub fn not_found(what: impl Into<String>) -> Self { Self::NotFound { what: what.into() } }

    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::CacheStorageError { reason: format!("{context}: {err}") }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Busy { .. } => "busy",
            Self::GateFailed { .. } => "gate_failed",
            Self::ArtifactUnavailable { .. } => "artifact_unavailable",
            Self::IntegrityMismatch { .. } => "integrity_mismatch",
            Self::FetchFailed { .. } => "fetch_failed",
            Self::CacheStorageError { .. } => "cache_storage_error",
            Self::AlreadyRunning { .. } => "already_running",
            Self::Timeout { .. } => "timeout",
            Self::NotFound { .. } => "not_found",
            Self::BadRequest { .. } => "bad_request",
            Self::Registry { .. } => "registry_error",
            Self::EvalRunner { .. } => "eval_runner_error",
        }
    }

    /// Only transient transport failures qualify. Integrity and transition
    /// errors are precondition violations and surface verbatim.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FetchFailed { retryable, .. } => *retryable,
            Self::Registry { status, .. } => status.map(|s| s >= 500).unwrap_or(true),
            _ => false,
        }
    }

    /// Structured fields for API responses.
    pub fn detail(&self) -> Value {
        match self {
            Self::InvalidTransition { model_id, from, to, reason } => {
                json!({"model_id": model_id, "current_status": from, "attempted_status": to, "reason": reason})
            }
            Self::Busy { model_id } => json!({"model_id": model_id}),
            Self::GateFailed { model_id, suite, measured, threshold, eval_run_id } => {
                json!({"model_id": model_id, "suite": suite, "measured": measured, "threshold": threshold, "eval_run_id": eval_run_id})
            }
            Self::ArtifactUnavailable { model_id, reason, cause } => json!({
                "model_id": model_id,
                "reason": reason,
                "cause": cause.as_ref().map(|c| json!({"error": c.code(), "detail": c.detail()})),
            }),
            Self::IntegrityMismatch { artifact_uri, expected_sha256, actual_sha256, expected_size, actual_size } => json!({
                "artifact_uri": artifact_uri,
                "expected_sha256": expected_sha256,
                "actual_sha256": actual_sha256,
                "expected_size": expected_size,
                "actual_size": actual_size,
            }),
            Self::FetchFailed { artifact_uri, reason, attempts, retryable } => {
                json!({"artifact_uri": artifact_uri, "reason": reason, "attempts": attempts, "retryable": retryable})
            }
            Self::CacheStorageError { reason } => json!({"reason": reason}),
            Self::AlreadyRunning { model_id } => json!({"model_id": model_id}),
            Self::Timeout { operation, after_secs } => json!({"operation": operation, "after_secs": after_secs}),
            Self::NotFound { what } => json!({"what": what}),
            Self::BadRequest { message } => json!({"message": message}),
            Self::Registry { status, detail } => json!({"upstream": "model-registry", "status": status, "error": detail}),
            Self::EvalRunner { exit_code, detail } => json!({"upstream": "eval-runner", "exit_code": exit_code, "error": detail}),
        }
    }
}
