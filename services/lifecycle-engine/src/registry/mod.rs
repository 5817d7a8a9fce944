//! Contract the engine consumes from the model registry.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::model::{AuditEvent, Model, ModelQuery, ModelStatus, NewAuditEvent};

mod http;
mod memory;

pub use http::HttpRegistry;
pub use memory::MemoryRegistry;

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_model(&self, model_id: i64) -> Result<Model>;

    async fn list_models(&self, query: &ModelQuery) -> Result<Vec<Model>>;

    /// Raw status write. Transition rules live in the engine, not here.
    async fn set_status(&self, model_id: i64, to: ModelStatus) -> Result<Model>;

    async fn get_metrics(&self, model_id: i64) -> Result<Map<String, Value>>;

    async fn put_metrics(&self, model_id: i64, metrics: Map<String, Value>) -> Result<Model>;

    async fn append_event(&self, model_id: i64, event: NewAuditEvent) -> Result<AuditEvent>;

    async fn list_events(&self, model_id: i64, limit: u32, offset: u32) -> Result<Vec<AuditEvent>>;

    async fn health(&self) -> Result<Value>;
}
