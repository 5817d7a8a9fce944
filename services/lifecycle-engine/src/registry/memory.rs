use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::Registry;
use crate::error::{EngineError, Result};
use crate::model::{AuditEvent, Model, ModelQuery, ModelStatus, NewAuditEvent};

/// In-process registry for development and tests.
///
/// `updated_at` is strictly increasing across writes so "latest write wins"
/// queries stay deterministic even within one clock tick.
#[derive(Default)]
pub struct MemoryRegistry {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    models: BTreeMap<i64, Model>,
    events: HashMap<i64, Vec<AuditEvent>>,
    next_event_id: i64,
    last_write: Option<DateTime<Utc>>,
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_write {
            if now <= last { now = last + ChronoDuration::microseconds(1); }
        }
        self.last_write = Some(now);
        now
    }
}

impl MemoryRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_models(models: impl IntoIterator<Item = Model>) -> Self {
        let reg = Self::new();
        for m in models { reg.insert(m); }
        reg
    }

    /// Seed from a JSON array of model records.
    pub fn from_seed_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let models: Vec<Model> = serde_json::from_str(&text)?;
        Ok(Self::with_models(models))
    }

    pub fn insert(&self, mut model: Model) {
        let mut st = self.state.write();
        let now = st.tick();
        model.created_at.get_or_insert(now);
        model.updated_at = Some(now);
        st.models.insert(model.id, model);
    }

    pub fn events(&self, model_id: i64) -> Vec<AuditEvent> {
        self.state.read().events.get(&model_id).cloned().unwrap_or_default()
    }

    fn missing(model_id: i64) -> EngineError { EngineError::not_found(format!("model {model_id}")) }
}

fn query_matches(query: &ModelQuery, m: &Model) -> bool {
    if let Some(s) = query.status { if m.status != s { return false; } }
    if let Some(n) = &query.name { if &m.name != n { return false; } }
    if let Some(q) = &query.q {
        let q = q.to_lowercase();
        if !m.name.to_lowercase().contains(&q) && !m.version.to_lowercase().contains(&q) { return false; }
    }
    if let Some(t) = &query.tag {
        let tagged = m.extra.get("tags").and_then(|v| v.as_array()).map(|tags| tags.iter().any(|x| x.as_str() == Some(t.as_str()))).unwrap_or(false);
        if !tagged { return false; }
    }
    true
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_model(&self, model_id: i64) -> Result<Model> {
        self.state.read().models.get(&model_id).cloned().ok_or_else(|| Self::missing(model_id))
    }

    async fn list_models(&self, query: &ModelQuery) -> Result<Vec<Model>> {
        let st = self.state.read();
        let mut out: Vec<Model> = st.models.values().filter(|m| query_matches(query, m)).cloned().collect();
        let desc = !matches!(query.order.as_deref(), Some("asc"));
        match query.sort.as_deref() {
            Some("id") => out.sort_by_key(|m| m.id),
            Some("name") => out.sort_by(|a, b| a.name.cmp(&b.name)),
            _ => out.sort_by_key(|m| m.updated_at),
        }
        if desc { out.reverse(); }
        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.unwrap_or(50) as usize;
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn set_status(&self, model_id: i64, to: ModelStatus) -> Result<Model> {
        let mut st = self.state.write();
        let now = st.tick();
        let m = st.models.get_mut(&model_id).ok_or_else(|| Self::missing(model_id))?;
        m.status = to;
        m.updated_at = Some(now);
        Ok(m.clone())
    }

    async fn get_metrics(&self, model_id: i64) -> Result<Map<String, Value>> {
        Ok(self.get_model(model_id).await?.metrics)
    }

    async fn put_metrics(&self, model_id: i64, metrics: Map<String, Value>) -> Result<Model> {
        let mut st = self.state.write();
        let now = st.tick();
        let m = st.models.get_mut(&model_id).ok_or_else(|| Self::missing(model_id))?;
        m.metrics = metrics;
        m.updated_at = Some(now);
        Ok(m.clone())
    }

    async fn append_event(&self, model_id: i64, event: NewAuditEvent) -> Result<AuditEvent> {
        let mut st = self.state.write();
        if !st.models.contains_key(&model_id) { return Err(Self::missing(model_id)); }
        st.next_event_id += 1;
        let ev = AuditEvent {
            id: Some(st.next_event_id),
            model_id,
            event_type: event.event_type,
            actor: Some(event.actor),
            payload: event.payload,
            created_at: Some(Utc::now()),
        };
        st.events.entry(model_id).or_default().push(ev.clone());
        Ok(ev)
    }

    async fn list_events(&self, model_id: i64, limit: u32, offset: u32) -> Result<Vec<AuditEvent>> {
        let st = self.state.read();
        let events = st.events.get(&model_id).map(|v| v.as_slice()).unwrap_or(&[]);
        Ok(events.iter().rev().skip(offset as usize).take(limit as usize).cloned().collect())
    }

    async fn health(&self) -> Result<Value> {
        Ok(json!({"status": "ok", "backend": "memory", "models": self.state.read().models.len()}))
    }
}
