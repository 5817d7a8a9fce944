use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, instrument};

use super::Registry;
use crate::error::{EngineError, Result};
use crate::model::{AuditEvent, Model, ModelQuery, ModelStatus, NewAuditEvent};

const UPSTREAM: &str = "model-registry";

/// Registry reached over its HTTP API. Authenticated calls send `X-API-Key`.
#[derive(Clone)]
pub struct HttpRegistry {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRegistry {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).connect_timeout(connect_timeout).build()?;
        Ok(Self::with_client(client, base_url, api_key))
    }

    pub fn with_client(client: Client, base_url: &str, api_key: Option<String>) -> Self {
        let api_key = api_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
        Self { client, base_url: base_url.trim().trim_end_matches('/').to_string(), api_key }
    }

    pub fn base_url(&self) -> &str { &self.base_url }

    pub fn auth_configured(&self) -> bool { self.api_key.is_some() }

    async fn request(&self, method: Method, path: &str, query: &[(&str, String)], body: Option<&Value>, auth: bool) -> Result<Value> {
        if self.base_url.is_empty() {
            return Err(EngineError::Registry { status: Some(503), detail: json!(format!("{UPSTREAM} base URL not configured")) });
        }
        let mut req = self.client.request(method.clone(), format!("{}{}", self.base_url, path)).query(query);
        if auth {
            let key = self.api_key.as_ref().ok_or_else(|| EngineError::Registry {
                status: Some(503),
                detail: json!("registry api key not configured for lifecycle engine"),
            })?;
            req = req.header("X-API-Key", key);
        }
        if let Some(b) = body { req = req.json(b); }
        debug!(%method, path, "registry request");

        let resp = req.send().await.map_err(|e| EngineError::Registry {
            status: None,
            detail: json!(format!("{UPSTREAM} request failed: {e}")),
        })?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::not_found(format!("{UPSTREAM} resource {path}")));
        }
        if status.is_client_error() || status.is_server_error() {
            let text = resp.text().await.unwrap_or_default();
            let payload = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| json!({ "detail": text }));
            return Err(EngineError::Registry { status: Some(status.as_u16()), detail: payload });
        }
        if status == StatusCode::NO_CONTENT { return Ok(Value::Null); }
        resp.json::<Value>().await.map_err(|e| EngineError::Registry {
            status: Some(502),
            detail: json!(format!("{UPSTREAM} returned invalid JSON: {e}")),
        })
    }
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| EngineError::Registry {
        status: Some(502),
        detail: json!(format!("{UPSTREAM} returned an invalid {what}: {e}")),
    })
}

/// Collections arrive either bare or wrapped as `{"items": [...]}`.
fn unwrap_items(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut obj) => obj.remove("items").or_else(|| obj.remove(key)).unwrap_or(Value::Array(vec![])),
        other => other,
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    #[instrument(skip(self))]
    async fn get_model(&self, model_id: i64) -> Result<Model> {
        let v = self.request(Method::GET, &format!("/models/{model_id}"), &[], None, true).await?;
        decode(v, "model")
    }

    async fn list_models(&self, query: &ModelQuery) -> Result<Vec<Model>> {
        let mut params: Vec<(&str, String)> = vec![
            ("limit", query.limit.unwrap_or(50).to_string()),
            ("offset", query.offset.unwrap_or(0).to_string()),
            ("sort", query.sort.clone().unwrap_or_else(|| "updated_at".into())),
            ("order", query.order.clone().unwrap_or_else(|| "desc".into())),
        ];
        if let Some(s) = query.status { params.push(("status", s.to_string())); }
        if let Some(n) = &query.name { params.push(("name", n.clone())); }
        if let Some(q) = &query.q { params.push(("q", q.clone())); }
        if let Some(t) = &query.tag { params.push(("tag", t.clone())); }
        let v = self.request(Method::GET, "/models", &params, None, true).await?;
        decode(unwrap_items(v, "models"), "model list")
    }

    #[instrument(skip(self))]
    async fn set_status(&self, model_id: i64, to: ModelStatus) -> Result<Model> {
        let v = self.request(Method::POST, &format!("/models/{model_id}/promote"), &[("to_status", to.to_string())], None, true).await?;
        decode(v, "model")
    }

    async fn get_metrics(&self, model_id: i64) -> Result<Map<String, Value>> {
        let v = self.request(Method::GET, &format!("/models/{model_id}/metrics"), &[], None, true).await?;
        Ok(match v {
            Value::Object(mut obj) => match obj.remove("metrics") {
                Some(Value::Object(inner)) => inner,
                Some(other) => { obj.insert("metrics".into(), other); obj }
                None => obj,
            },
            _ => Map::new(),
        })
    }

    #[instrument(skip(self, metrics))]
    async fn put_metrics(&self, model_id: i64, metrics: Map<String, Value>) -> Result<Model> {
        let body = json!({ "metrics": metrics });
        let v = self.request(Method::PUT, &format!("/models/{model_id}/metrics"), &[], Some(&body), true).await?;
        if v.get("id").is_some() && v.get("status").is_some() {
            decode(v, "model")
        } else {
            self.get_model(model_id).await
        }
    }

    async fn append_event(&self, model_id: i64, event: NewAuditEvent) -> Result<AuditEvent> {
        let body = serde_json::to_value(&event).map_err(|e| EngineError::bad_request(e.to_string()))?;
        let v = self.request(Method::POST, &format!("/models/{model_id}/events"), &[], Some(&body), true).await?;
        match serde_json::from_value::<AuditEvent>(v) {
            Ok(ev) => Ok(ev),
            // some registry builds acknowledge with an id only
            Err(_) => Ok(AuditEvent {
                id: None,
                model_id,
                event_type: event.event_type,
                actor: Some(event.actor),
                payload: event.payload,
                created_at: Some(chrono::Utc::now()),
            }),
        }
    }

    async fn list_events(&self, model_id: i64, limit: u32, offset: u32) -> Result<Vec<AuditEvent>> {
        let params = [("limit", limit.to_string()), ("offset", offset.to_string())];
        let v = self.request(Method::GET, &format!("/models/{model_id}/events"), &params, None, true).await?;
        decode(unwrap_items(v, "events"), "event list")
    }

    async fn health(&self) -> Result<Value> {
        self.request(Method::GET, "/health", &[], None, false).await
    }
}
