mod common;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use common::{model, Fixture, ScriptedRunner};
use lifecycle_engine::model::{AuditEvent, ModelQuery, NewAuditEvent};
use lifecycle_engine::{EngineError, GateRequest, MemoryRegistry, Model, ModelStatus, Registry, Result};

fn promote_events(events: &[AuditEvent]) -> Vec<&AuditEvent> {
    events.iter().filter(|e| e.event_type == "promote").collect()
}

#[tokio::test]
async fn gate_below_threshold_leaves_status_untouched() {
    let fx = Fixture::new(ScriptedRunner::passing(0.92));
    let err = fx
        .engine
        .promotions
        .gate_and_promote(7, ModelStatus::Staging, GateRequest::new("smoke-v1", 1.0), "ci")
        .await
        .unwrap_err();
    match err {
        EngineError::GateFailed { model_id, measured, threshold, ref suite, .. } => {
            assert_eq!(model_id, 7);
            assert_eq!(measured, 0.92);
            assert_eq!(threshold, 1.0);
            assert_eq!(suite, "smoke-v1");
        }
        other => panic!("expected GateFailed, got {other:?}"),
    }
    assert_eq!(fx.status(7).await, "experimental");

    let events = fx.memory.events(7);
    assert!(promote_events(&events).is_empty());
    let gate: Vec<_> = events.iter().filter(|e| e.event_type == "gate").collect();
    assert_eq!(gate.len(), 1);
    assert_eq!(gate[0].payload["passed"], json!(false));
    assert_eq!(gate[0].actor.as_deref(), Some("ci"));
}

#[tokio::test]
async fn gate_at_threshold_promotes_exactly_once() {
    let fx = Fixture::new(ScriptedRunner::passing(1.0));
    let done = fx
        .engine
        .promotions
        .gate_and_promote(7, ModelStatus::Staging, GateRequest::new("smoke-v1", 1.0), "dashboard")
        .await
        .unwrap();
    assert_eq!(done.model.status, ModelStatus::Staging);
    assert!(done.gate.passed);
    assert_eq!(fx.status(7).await, "staging");

    let events = fx.memory.events(7);
    let promotes = promote_events(&events);
    assert_eq!(promotes.len(), 1);
    let payload = &promotes[0].payload;
    assert_eq!(payload["from"], "experimental");
    assert_eq!(payload["to"], "staging");
    assert_eq!(payload["gated_by"], "smoke-v1");
    assert_eq!(payload["mode"], "gated");
    assert_eq!(payload["eval_run_id"], json!(done.gate.eval_run.eval_run_id));
    // gate event is recorded before the promotion
    assert_eq!(events[0].event_type, "gate");
    assert_eq!(fx.runner.calls(), 1);
}

#[tokio::test]
async fn manual_promote_follows_transition_table() {
    let fx = Fixture::new(ScriptedRunner::passing(1.0));
    let mut id = 100;
    for from in ModelStatus::ALL {
        for to in ModelStatus::ALL {
            id += 1;
            fx.memory.insert(model(id, "table", from.as_str()));
            let result = fx.engine.promotions.promote(id, to, "admin").await;
            let events = fx.memory.events(id);
            if from.can_transition_to(to) {
                let m = result.unwrap_or_else(|e| panic!("{from} -> {to} should pass: {e}"));
                assert_eq!(m.status, to);
                assert_eq!(events.len(), 1, "{from} -> {to}");
                assert_eq!(events[0].payload["mode"], "manual");
                assert!(events[0].payload.get("gated_by").is_none());
            } else {
                assert!(matches!(result, Err(EngineError::InvalidTransition { .. })), "{from} -> {to}");
                assert!(events.is_empty());
                assert_eq!(fx.status(id).await, from.as_str());
            }
        }
    }
}

#[tokio::test]
async fn frozen_model_only_archives() {
    let fx = Fixture::new(ScriptedRunner::passing(1.0));
    let mut m = model(20, "frozen", "staging");
    m.frozen = true;
    fx.memory.insert(m);

    let err = fx.engine.promotions.promote(20, ModelStatus::Production, "admin").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { from: ModelStatus::Staging, to: ModelStatus::Production, .. }));
    let err = fx
        .engine
        .promotions
        .gate_and_promote(20, ModelStatus::Production, GateRequest::new("smoke-v1", 0.5), "ci")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert_eq!(fx.runner.calls(), 0, "illegal targets are rejected before any eval");

    let archived = fx.engine.promotions.promote(20, ModelStatus::Archived, "admin").await.unwrap();
    assert_eq!(archived.status, ModelStatus::Archived);
}

#[tokio::test]
async fn concurrent_operations_on_one_model_are_busy() {
    let fx = Fixture::new(ScriptedRunner::passing(1.0).slow(Duration::from_millis(300)));
    let engine = fx.engine.clone();
    let gate = tokio::spawn(async move { engine.promotions.gate(7, GateRequest::new("smoke-v1", 0.9), "ci").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(fx.engine.promotions.is_busy(7));
    let err = fx.engine.promotions.promote(7, ModelStatus::Staging, "admin").await.unwrap_err();
    assert!(matches!(err, EngineError::Busy { model_id: 7 }));
    let err = fx.engine.promotions.gate(7, GateRequest::new("smoke-v1", 0.9), "ci").await.unwrap_err();
    assert!(matches!(err, EngineError::Busy { .. }));

    let report = gate.await.unwrap().unwrap();
    assert!(report.passed);
    assert_eq!(fx.status(7).await, "experimental", "gate alone never changes status");
    assert!(!fx.engine.promotions.is_busy(7));
    fx.engine.promotions.promote(7, ModelStatus::Staging, "admin").await.unwrap();
}

#[tokio::test]
async fn racing_promotions_have_one_winner() {
    let fx = Fixture::new(ScriptedRunner::passing(1.0));
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let engine = fx.engine.clone();
        tasks.push(tokio::spawn(async move { engine.promotions.promote(7, ModelStatus::Staging, "race").await }));
    }
    let mut wins = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::Busy { .. }) | Err(EngineError::InvalidTransition { .. }) => {}
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(fx.status(7).await, "staging");
    assert_eq!(promote_events(&fx.memory.events(7)).len(), 1);
}

#[tokio::test]
async fn other_models_proceed_while_one_is_busy() {
    let fx = Fixture::new(ScriptedRunner::passing(1.0).slow(Duration::from_millis(200)));
    fx.memory.insert(model(8, "other", "staging"));
    let engine = fx.engine.clone();
    let gate = tokio::spawn(async move { engine.promotions.gate(7, GateRequest::new("smoke-v1", 0.5), "ci").await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    fx.engine.promotions.promote(8, ModelStatus::Production, "admin").await.unwrap();
    gate.await.unwrap().unwrap();
}

#[tokio::test]
async fn current_production_is_latest_write() {
    let fx = Fixture::new(ScriptedRunner::passing(1.0));
    fx.memory.insert(model(30, "onyx-prod", "staging"));
    fx.memory.insert(model(31, "onyx-prod", "staging"));
    fx.engine.promotions.promote(30, ModelStatus::Production, "admin").await.unwrap();
    fx.engine.promotions.promote(31, ModelStatus::Production, "admin").await.unwrap();

    let current = fx.engine.promotions.current_production("onyx-prod").await.unwrap();
    assert_eq!(current.id, 31);
    // retiring the previous production model is left to the caller
    assert_eq!(fx.status(30).await, "production");

    assert!(matches!(fx.engine.promotions.current_production("ghost").await, Err(EngineError::NotFound { .. })));
}

#[tokio::test]
async fn invalid_threshold_is_rejected() {
    let fx = Fixture::new(ScriptedRunner::passing(1.0));
    let err = fx.engine.promotions.gate(7, GateRequest::new("smoke-v1", 1.5), "ci").await.unwrap_err();
    assert!(matches!(err, EngineError::BadRequest { .. }));
    assert_eq!(fx.runner.calls(), 0);
}

#[tokio::test]
async fn missing_artifact_aborts_gate_before_eval() {
    let fx = Fixture::new(ScriptedRunner::passing(1.0));
    let mut m = model(40, "no-weights", "experimental");
    m.artifact_uri = None;
    fx.memory.insert(m);
    let err = fx
        .engine
        .promotions
        .gate_and_promote(40, ModelStatus::Staging, GateRequest::new("smoke-v1", 0.5), "ci")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ArtifactUnavailable { model_id: 40, .. }));
    assert_eq!(fx.runner.calls(), 0);
    assert_eq!(fx.status(40).await, "experimental");
}

/// Delegates to memory but refuses promotion audit events.
struct FailingAudit(Arc<MemoryRegistry>);

#[async_trait]
impl Registry for FailingAudit {
    async fn get_model(&self, id: i64) -> Result<Model> { self.0.get_model(id).await }
    async fn list_models(&self, q: &ModelQuery) -> Result<Vec<Model>> { self.0.list_models(q).await }
    async fn set_status(&self, id: i64, to: ModelStatus) -> Result<Model> { self.0.set_status(id, to).await }
    async fn get_metrics(&self, id: i64) -> Result<Map<String, Value>> { self.0.get_metrics(id).await }
    async fn put_metrics(&self, id: i64, m: Map<String, Value>) -> Result<Model> { self.0.put_metrics(id, m).await }
    async fn append_event(&self, id: i64, event: NewAuditEvent) -> Result<AuditEvent> {
        if event.event_type == "promote" {
            return Err(EngineError::Registry { status: Some(503), detail: json!("events table unavailable") });
        }
        self.0.append_event(id, event).await
    }
    async fn list_events(&self, id: i64, limit: u32, offset: u32) -> Result<Vec<AuditEvent>> { self.0.list_events(id, limit, offset).await }
    async fn health(&self) -> Result<Value> { self.0.health().await }
}

#[tokio::test]
async fn failed_audit_append_restores_status() {
    let fx = Fixture::with_registry(ScriptedRunner::passing(1.0), |m| Arc::new(FailingAudit(m)) as Arc<dyn Registry>);
    let err = fx.engine.promotions.promote(7, ModelStatus::Staging, "admin").await.unwrap_err();
    assert!(matches!(err, EngineError::Registry { status: Some(503), .. }));
    assert_eq!(fx.status(7).await, "experimental");

    let err = fx
        .engine
        .promotions
        .gate_and_promote(7, ModelStatus::Production, GateRequest::new("core-v1", 0.5), "ci")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Registry { .. }));
    assert_eq!(fx.status(7).await, "experimental");
}

/// Delegates to memory but stores every suite result at a fixed pass rate.
struct CappedMetrics(Arc<MemoryRegistry>);

#[async_trait]
impl Registry for CappedMetrics {
    async fn get_model(&self, id: i64) -> Result<Model> { self.0.get_model(id).await }
    async fn list_models(&self, q: &ModelQuery) -> Result<Vec<Model>> { self.0.list_models(q).await }
    async fn set_status(&self, id: i64, to: ModelStatus) -> Result<Model> { self.0.set_status(id, to).await }
    async fn get_metrics(&self, id: i64) -> Result<Map<String, Value>> { self.0.get_metrics(id).await }
    async fn put_metrics(&self, id: i64, mut m: Map<String, Value>) -> Result<Model> {
        if let Some(Value::Object(suites)) = m.get_mut("suites") {
            for entry in suites.values_mut() { entry["pass_rate"] = json!(0.3); }
        }
        self.0.put_metrics(id, m).await
    }
    async fn append_event(&self, id: i64, event: NewAuditEvent) -> Result<AuditEvent> { self.0.append_event(id, event).await }
    async fn list_events(&self, id: i64, limit: u32, offset: u32) -> Result<Vec<AuditEvent>> { self.0.list_events(id, limit, offset).await }
    async fn health(&self) -> Result<Value> { self.0.health().await }
}

#[tokio::test]
async fn gate_decides_on_the_stored_result() {
    let fx = Fixture::with_registry(ScriptedRunner::passing(0.9), |m| Arc::new(CappedMetrics(m)) as Arc<dyn Registry>);
    let err = fx
        .engine
        .promotions
        .gate_and_promote(7, ModelStatus::Production, GateRequest::new("core-v1", 0.5), "ci")
        .await
        .unwrap_err();
    match err {
        EngineError::GateFailed { measured, threshold, .. } => {
            assert_eq!(measured, 0.3);
            assert_eq!(threshold, 0.5);
        }
        other => panic!("expected GateFailed, got {other:?}"),
    }
    assert_eq!(fx.status(7).await, "experimental");
    let events = fx.memory.events(7);
    let gate = events.iter().find(|e| e.event_type == "gate").unwrap();
    assert_eq!(gate.payload["pass_rate"], json!(0.3));
    assert_eq!(gate.payload["passed"], json!(false));
}
