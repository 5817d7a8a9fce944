//! Authoritative gate for status transitions.
//!
//! Every promotion-affecting call holds the model's exclusion guard for its
//! whole duration; a concurrent call for the same model fails with `Busy`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use caia_core::{ExclusionGuard, KeyedExclusion};

use crate::error::{EngineError, Result};
use crate::eval::{EvalCoordinator, StartEval};
use crate::metrics;
use crate::model::{EvalRun, Model, ModelQuery, ModelStatus, NewAuditEvent};
use crate::registry::Registry;

const PRODUCTION_SCAN_LIMIT: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionMode { Manual, Gated }

impl PromotionMode {
    fn as_str(&self) -> &'static str {
        match self {
            PromotionMode::Manual => "manual",
            PromotionMode::Gated => "gated",
        }
    }
}

/// Parameters of a gate check.
#[derive(Debug, Clone, Deserialize)]
pub struct GateRequest {
    pub suite: String,
    pub threshold: f64,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
}

impl GateRequest {
    pub fn new(suite: impl Into<String>, threshold: f64) -> Self {
        Self { suite: suite.into(), threshold, max_tokens: None, temperature: None, timeout_seconds: None, request_timeout_seconds: None }
    }

    fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(EngineError::bad_request(format!("threshold {} outside [0.0, 1.0]", self.threshold)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub model_id: i64,
    pub suite: String,
    pub threshold: f64,
    pub pass_rate: f64,
    pub passed: bool,
    pub eval_run: EvalRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatedPromotion {
    pub model: Model,
    pub gate: GateReport,
}

pub struct PromotionEngine {
    registry: Arc<dyn Registry>,
    evals: Arc<EvalCoordinator>,
    busy: KeyedExclusion<i64>,
}

/// Checks that do not depend on eval results.
pub fn check_transition(model: &Model, to: ModelStatus) -> Result<()> {
    let reject = |reason: &str| {
        Err(EngineError::InvalidTransition { model_id: model.id, from: model.status, to, reason: reason.to_string() })
    };
    if model.status == to { return reject("model already has this status"); }
    if model.status.is_terminal() { return reject("archived is terminal"); }
    if model.frozen && to != ModelStatus::Archived { return reject("model is frozen; only archival is allowed"); }
    if !model.status.can_transition_to(to) { return reject("transition not allowed"); }
    Ok(())
}

impl PromotionEngine {
    pub fn new(registry: Arc<dyn Registry>, evals: Arc<EvalCoordinator>) -> Self {
        Self { registry, evals, busy: KeyedExclusion::new() }
    }

    pub fn is_busy(&self, model_id: i64) -> bool { self.busy.is_held(&model_id) }

    fn acquire(&self, model_id: i64) -> Result<ExclusionGuard<i64>> {
        self.busy.try_acquire(model_id).ok_or_else(|| {
            tracing::debug!(model_id, "promotion lock contended");
            EngineError::Busy { model_id }
        })
    }

    /// Manual override. Only transition legality and the frozen rule apply.
    #[instrument(skip(self))]
    pub async fn promote(&self, model_id: i64, to: ModelStatus, actor: &str) -> Result<Model> {
        let _guard = self.acquire(model_id)?;
        let model = self.registry.get_model(model_id).await?;
        check_transition(&model, to)?;
        self.transition(&model, to, actor, PromotionMode::Manual, None).await
    }

    /// Inspection only: runs the suite and records a gate event, never
    /// touches status.
    #[instrument(skip(self, req), fields(suite = %req.suite, threshold = req.threshold))]
    pub async fn gate(&self, model_id: i64, req: GateRequest, actor: &str) -> Result<GateReport> {
        req.validate()?;
        let _guard = self.acquire(model_id)?;
        self.run_gate(model_id, &req, actor).await
    }

    /// Gate then promote, both under one hold of the model's guard. Below
    /// threshold the model is left untouched and `GateFailed` is returned.
    #[instrument(skip(self, req), fields(suite = %req.suite, threshold = req.threshold))]
    pub async fn gate_and_promote(&self, model_id: i64, to: ModelStatus, req: GateRequest, actor: &str) -> Result<GatedPromotion> {
        req.validate()?;
        let _guard = self.acquire(model_id)?;
        // reject illegal targets before spending an eval run on them
        check_transition(&self.registry.get_model(model_id).await?, to)?;

        let gate = self.run_gate(model_id, &req, actor).await?;
        if !gate.passed {
            warn!(model_id, suite = %gate.suite, pass_rate = gate.pass_rate, threshold = gate.threshold, "gate failed, status unchanged");
            return Err(EngineError::GateFailed {
                model_id,
                suite: gate.suite,
                measured: gate.pass_rate,
                threshold: gate.threshold,
                eval_run_id: gate.eval_run.eval_run_id,
            });
        }

        // status may have changed outside the engine while the eval ran
        let model = self.registry.get_model(model_id).await?;
        check_transition(&model, to)?;
        let model = self.transition(&model, to, actor, PromotionMode::Gated, Some(&gate)).await?;
        Ok(GatedPromotion { model, gate })
    }

    /// The decision uses the suite result as stored in the registry after
    /// the run, so a gate never passes on a measurement the model lacks.
    async fn run_gate(&self, model_id: i64, req: &GateRequest, actor: &str) -> Result<GateReport> {
        let run = self
            .evals
            .start(StartEval {
                model_id,
                suite: req.suite.clone(),
                max_tokens: req.max_tokens,
                temperature: req.temperature,
                timeout_seconds: req.timeout_seconds,
                request_timeout_seconds: req.request_timeout_seconds,
                inference_url: None,
            })
            .await?;
        let stored = self
            .registry
            .get_model(model_id)
            .await?
            .suite_result(&run.suite)
            .filter(|r| r.eval_run_id.as_deref() == Some(run.eval_run_id.as_str()))
            .ok_or_else(|| {
                warn!(model_id, suite = %run.suite, eval_run_id = %run.eval_run_id, "finished run missing from stored metrics");
                EngineError::Registry {
                    status: None,
                    detail: json!({"message": "suite result not recorded", "suite": run.suite, "eval_run_id": run.eval_run_id}),
                }
            })?;
        let pass_rate = stored.pass_rate;
        let passed = pass_rate >= req.threshold;
        metrics::GATE_ATTEMPTS.with_label_values(&[if passed { "pass" } else { "fail" }]).inc();

        let payload = json!({
            "suite": run.suite,
            "threshold": req.threshold,
            "pass_rate": pass_rate,
            "passed": passed,
            "eval_run_id": run.eval_run_id,
        });
        self.registry.append_event(model_id, NewAuditEvent { event_type: "gate".into(), actor: actor.to_string(), payload }).await?;
        info!(model_id, suite = %run.suite, pass_rate, passed, "gate evaluated");
        Ok(GateReport { model_id, suite: run.suite.clone(), threshold: req.threshold, pass_rate, passed, eval_run: run })
    }

    /// Status write plus its audit event. If the event cannot be appended the
    /// previous status is restored so the model is never changed without a
    /// record.
    async fn transition(&self, model: &Model, to: ModelStatus, actor: &str, mode: PromotionMode, gate: Option<&GateReport>) -> Result<Model> {
        let updated = self.registry.set_status(model.id, to).await?;

        let mut payload = json!({"from": model.status, "to": to, "mode": mode.as_str()});
        if let (Some(g), Value::Object(obj)) = (gate, &mut payload) {
            obj.insert("gated_by".into(), json!(g.suite));
            obj.insert("eval_run_id".into(), json!(g.eval_run.eval_run_id));
            obj.insert("pass_rate".into(), json!(g.pass_rate));
            obj.insert("threshold".into(), json!(g.threshold));
        }
        let event = NewAuditEvent { event_type: "promote".into(), actor: actor.to_string(), payload };
        if let Err(e) = self.registry.append_event(model.id, event).await {
            warn!(model_id = model.id, error = %e, "audit append failed, restoring previous status");
            if let Err(restore) = self.registry.set_status(model.id, model.status).await {
                error!(model_id = model.id, from = %model.status, to = %to, error = %restore, "failed to restore status after audit failure");
            }
            return Err(e);
        }

        metrics::PROMOTIONS.with_label_values(&[mode.as_str()]).inc();
        info!(model_id = model.id, from = %model.status, to = %to, mode = mode.as_str(), actor, "model status changed");
        Ok(updated)
    }

    /// Most recently updated model named `name` with production status.
    /// Derived on every call; nothing is cached.
    pub async fn current_production(&self, name: &str) -> Result<Model> {
        let query = ModelQuery {
            name: Some(name.to_string()),
            status: Some(ModelStatus::Production),
            sort: Some("updated_at".into()),
            order: Some("desc".into()),
            limit: Some(PRODUCTION_SCAN_LIMIT),
            ..Default::default()
        };
        self.registry
            .list_models(&query)
            .await?
            .into_iter()
            .filter(|m| m.name == name && m.status == ModelStatus::Production)
            .max_by_key(|m| m.updated_at)
            .ok_or_else(|| EngineError::not_found(format!("production model named {name}")))
    }
}
