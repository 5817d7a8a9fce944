//! Registry-owned records as the engine sees them.
//!
//! The engine never keeps these beyond one operation; the registry is the
//! only source of truth for status and metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus { Experimental, Staging, Production, Archived }

impl ModelStatus {
    pub const ALL: [ModelStatus; 4] = [ModelStatus::Experimental, ModelStatus::Staging, ModelStatus::Production, ModelStatus::Archived];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Experimental => "experimental",
            ModelStatus::Staging => "staging",
            ModelStatus::Production => "production",
            ModelStatus::Archived => "archived",
        }
    }

    pub fn is_terminal(&self) -> bool { matches!(self, ModelStatus::Archived) }

    /// Legal edges: experimental -> staging, staging -> production,
    /// experimental -> production, any non-archived -> archived.
    pub fn can_transition_to(&self, to: ModelStatus) -> bool {
        use ModelStatus::*;
        matches!(
            (*self, to),
            (Experimental, Staging) | (Staging, Production) | (Experimental, Production)
                | (Experimental, Archived) | (Staging, Archived) | (Production, Archived)
        )
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ModelStatus {
    type Err = EngineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "experimental" => Ok(ModelStatus::Experimental),
            "staging" => Ok(ModelStatus::Staging),
            "production" => Ok(ModelStatus::Production),
            "archived" => Ok(ModelStatus::Archived),
            other => Err(EngineError::bad_request(format!(
                "unknown status '{other}' (expected experimental, staging, production or archived)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    #[serde(default, deserialize_with = "de_version")]
    pub version: String,
    pub status: ModelStatus,
    #[serde(default)]
    pub artifact_uri: Option<String>,
    #[serde(default)]
    pub checkpoint_sha256: Option<String>,
    #[serde(default)]
    pub checkpoint_size_bytes: Option<u64>,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default, deserialize_with = "de_metrics")]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Registry fields the engine does not interpret (tags, notes, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn de_version<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn de_metrics<'de, D: Deserializer<'de>>(d: D) -> Result<Map<String, Value>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

impl Model {
    pub fn suite_result(&self, suite: &str) -> Option<SuiteResult> {
        ModelMetrics::parse(&self.metrics).suites.remove(suite)
    }
}

/// One suite's latest result, stored at `metrics.suites[suite]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub pass_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SuiteResult {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.pass_rate.is_finite() || !(0.0..=1.0).contains(&self.pass_rate) {
            return Err(EngineError::bad_request(format!("pass_rate {} outside [0.0, 1.0]", self.pass_rate)));
        }
        if let Some(score) = self.score {
            if !score.is_finite() { return Err(EngineError::bad_request("score must be finite")); }
        }
        Ok(())
    }
}

/// Typed view over the open `metrics` object. Writing back only touches
/// `suites[name]`, every other key keeps its original JSON.
#[derive(Debug, Clone, Default)]
pub struct ModelMetrics {
    pub suites: BTreeMap<String, SuiteResult>,
}

impl ModelMetrics {
    /// Entries that do not parse (legacy shapes, missing pass_rate) are skipped
    /// here but left untouched in the underlying object.
    pub fn parse(metrics: &Map<String, Value>) -> Self {
        let mut suites = BTreeMap::new();
        if let Some(Value::Object(raw)) = metrics.get("suites") {
            for (name, entry) in raw {
                match serde_json::from_value::<SuiteResult>(entry.clone()) {
                    Ok(r) => { suites.insert(name.clone(), r); }
                    Err(e) => tracing::debug!(suite = %name, error = %e, "skipping unparsable suite entry"),
                }
            }
        }
        Self { suites }
    }

    /// Replace (never merge) the entry for `suite`.
    pub fn set_suite(metrics: &mut Map<String, Value>, suite: &str, result: &SuiteResult) -> Result<(), EngineError> {
        result.validate()?;
        let value = serde_json::to_value(result).map_err(|e| EngineError::bad_request(e.to_string()))?;
        let suites = metrics.entry("suites").or_insert_with(|| Value::Object(Map::new()));
        if !suites.is_object() { *suites = Value::Object(Map::new()); }
        if let Value::Object(map) = suites { map.insert(suite.to_string(), value); }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(default)]
    pub id: Option<i64>,
    pub model_id: i64,
    pub event_type: String,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub event_type: String,
    pub actor: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelQuery {
    #[serde(default)]
    pub status: Option<ModelStatus>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
}

/// A finished evaluation. Runs are terminal once they exist on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRun {
    pub eval_run_id: String,
    pub model_id: i64,
    pub suite: String,
    pub pass_rate: f64,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,
    #[serde(default)]
    pub summary_path: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
