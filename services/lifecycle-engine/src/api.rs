//! Dashboard-facing HTTP/JSON surface.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::artifact_cache::{ResolveRequest, ResolvedArtifact};
use crate::error::{EngineError, Result};
use crate::eval::StartEval;
use crate::model::{EvalRun, Model, ModelStatus};
use crate::promotion::{GateReport, GateRequest, GatedPromotion};
use crate::Engine;

const ACTOR_HEADER: &str = "x-actor";
const DEFAULT_ACTOR: &str = "dashboard";

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::InvalidTransition { .. } | EngineError::Busy { .. } | EngineError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            EngineError::GateFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::ArtifactUnavailable { .. } => StatusCode::FAILED_DEPENDENCY,
            EngineError::IntegrityMismatch { .. } | EngineError::FetchFailed { .. } | EngineError::EvalRunner { .. } => StatusCode::BAD_GATEWAY,
            EngineError::CacheStorageError { .. } => StatusCode::INSUFFICIENT_STORAGE,
            EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            EngineError::Registry { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = %self, code = self.code(), "request failed");
        } else {
            debug!(error = %self, code = self.code(), "request rejected");
        }
        let body = json!({"error": self.code(), "message": self.to_string(), "detail": self.detail()});
        (status, Json(body)).into_response()
    }
}

pub type AppState = Arc<Engine>;

pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/models/production/:name", get(current_production))
        .route("/api/models/:id", get(get_model))
        .route("/api/models/:id/promote", post(promote))
        .route("/api/models/:id/gate", post(gate))
        .route("/api/models/:id/gate-and-promote", post(gate_and_promote))
        .route("/api/models/:id/resolve-checkpoint", post(resolve_checkpoint))
        .route("/api/artifacts/resolve", post(resolve_artifact))
        .route("/api/artifacts/stats", get(cache_stats))
        .route("/api/evals/run", post(run_eval))
        .route("/api/evals/runs", get(list_runs))
        .route("/api/evals/runs/:id/summary", get(run_summary))
        .route("/api/evals/runs/:id/jsonl", get(run_jsonl))
        .with_state(engine)
}

fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload.map(|Json(v)| v).map_err(|e| EngineError::bad_request(e.body_text()))
}

async fn health(State(engine): State<AppState>) -> Json<Value> {
    let registry = match engine.registry.health().await {
        Ok(detail) => json!({"reachable": true, "detail": detail}),
        Err(e) => json!({"reachable": false, "detail": e.detail()}),
    };
    let eval = engine.evals.settings();
    Json(json!({
        "status": "ok",
        "registry": registry,
        "artifact_cache": engine.cache.stats(),
        "eval": {
            "runs_dir": eval.runs_dir,
            "allowed_suites": eval.allowed_suites,
            "runner": engine.evals.runner().describe(),
        },
    }))
}

async fn get_model(State(engine): State<AppState>, Path(id): Path<i64>) -> Result<Json<Model>> {
    Ok(Json(engine.registry.get_model(id).await?))
}

async fn current_production(State(engine): State<AppState>, Path(name): Path<String>) -> Result<Json<Model>> {
    Ok(Json(engine.promotions.current_production(&name).await?))
}

#[derive(Debug, Deserialize)]
struct PromoteQuery {
    to_status: Option<String>,
}

async fn promote(
    State(engine): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<PromoteQuery>,
    headers: HeaderMap,
) -> Result<Json<Model>> {
    let to: ModelStatus = q.to_status.as_deref().unwrap_or("production").parse()?;
    Ok(Json(engine.promotions.promote(id, to, &actor(&headers)).await?))
}

async fn gate(
    State(engine): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: std::result::Result<Json<GateRequest>, JsonRejection>,
) -> Result<Json<GateReport>> {
    let req = body(payload)?;
    Ok(Json(engine.promotions.gate(id, req, &actor(&headers)).await?))
}

#[derive(Debug, Deserialize)]
struct GateAndPromoteBody {
    to_status: String,
    #[serde(flatten)]
    gate: GateRequest,
}

async fn gate_and_promote(
    State(engine): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: std::result::Result<Json<GateAndPromoteBody>, JsonRejection>,
) -> Result<Json<GatedPromotion>> {
    let req = body(payload)?;
    let to: ModelStatus = req.to_status.parse()?;
    Ok(Json(engine.promotions.gate_and_promote(id, to, req.gate, &actor(&headers)).await?))
}

#[derive(Debug, Default, Deserialize)]
struct TimeoutQuery {
    timeout_seconds: Option<u64>,
}

async fn resolve_checkpoint(
    State(engine): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<TimeoutQuery>,
) -> Result<Json<ResolvedArtifact>> {
    let model = engine.registry.get_model(id).await?;
    let uri = model
        .artifact_uri
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| EngineError::bad_request("model is missing artifact_uri"))?;
    let mut req = ResolveRequest::new(uri).expect(model.checkpoint_sha256.clone(), model.checkpoint_size_bytes);
    if let Some(secs) = q.timeout_seconds.filter(|s| *s > 0) { req = req.with_timeout(Duration::from_secs(secs)); }
    Ok(Json(engine.cache.resolve(req).await?))
}

async fn resolve_artifact(
    State(engine): State<AppState>,
    Query(q): Query<TimeoutQuery>,
    payload: std::result::Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<ResolvedArtifact>> {
    let mut req = body(payload)?;
    if let Some(secs) = q.timeout_seconds.filter(|s| *s > 0) { req = req.with_timeout(Duration::from_secs(secs)); }
    Ok(Json(engine.cache.resolve(req).await?))
}

async fn cache_stats(State(engine): State<AppState>) -> Json<Value> {
    Json(json!(engine.cache.stats()))
}

async fn run_eval(
    State(engine): State<AppState>,
    payload: std::result::Result<Json<StartEval>, JsonRejection>,
) -> Result<Json<EvalRun>> {
    let req = body(payload)?;
    Ok(Json(engine.evals.start(req).await?))
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    model_id: Option<i64>,
    limit: Option<usize>,
}

async fn list_runs(State(engine): State<AppState>, Query(q): Query<ListRunsQuery>) -> Result<Json<Vec<EvalRun>>> {
    Ok(Json(engine.evals.list(q.model_id, q.limit).await?))
}

async fn run_summary(State(engine): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    Ok(Json(engine.evals.get_summary(&id).await?))
}

async fn run_jsonl(State(engine): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let file = engine.evals.detail_stream(&id).await?;
    let stream = Body::from_stream(ReaderStream::new(file));
    Ok(([(header::CONTENT_TYPE, "application/jsonl")], stream).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(EngineError::Busy { model_id: 1 }.status_code(), StatusCode::CONFLICT);
        assert_eq!(EngineError::CacheStorageError { reason: "full".into() }.status_code(), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(EngineError::Registry { status: Some(401), detail: Value::Null }.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(EngineError::Registry { status: Some(200), detail: Value::Null }.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(EngineError::Registry { status: None, detail: Value::Null }.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn actor_defaults_to_dashboard() {
        let mut headers = HeaderMap::new();
        assert_eq!(actor(&headers), "dashboard");
        headers.insert("x-actor", "ci-bot".parse().unwrap());
        assert_eq!(actor(&headers), "ci-bot");
    }
}
