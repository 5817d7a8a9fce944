//! Core shared utilities for Caia services.

use anyhow::Result;
use axum::{http::header, response::IntoResponse, routing::get, Router};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static SERVICE_NAME: OnceCell<String> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

/// Install the global subscriber. Safe to call more than once.
///
/// `RUST_LOG` drives filtering (default `info`); `CAIA_JSON_LOG=1` switches to
/// flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let _ = SERVICE_NAME.set(service.to_string());
        let json = std::env::var("CAIA_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "caia_core", service, "tracing initialized");
    Ok(())
}

/// Layered configuration: serde defaults on `T`, then the file named by
/// `CAIA_CONFIG_FILE`, then `CAIA__SECTION__KEY` environment variables.
///
/// `list_keys` names dotted keys whose environment values are comma separated lists.
pub fn load_config<T: DeserializeOwned>(list_keys: &[&str]) -> Result<T> {
    let mut builder = config::Config::builder();
    if let Ok(file) = std::env::var("CAIA_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(true));
    }
    let mut env = config::Environment::with_prefix("CAIA").separator("__").try_parsing(true);
    if !list_keys.is_empty() {
        env = env.list_separator(",");
        for key in list_keys { env = env.with_list_parse_key(key); }
    }
    builder = builder.add_source(env);
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let app = Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)})) }))
        .route("/status", get(|| async {
            axum::Json(serde_json::json!({
                "service": SERVICE_NAME.get().cloned(),
                "live": NODE_LIVENESS.load(Ordering::SeqCst),
                "ready": NODE_READINESS.load(Ordering::SeqCst),
            }))
        }))
        .route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error=?e, "health server failed");
        }
    });
    Ok(())
}

async fn metrics_handler() -> axum::response::Response {
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

mod resilience;
pub use resilience::{retry_async, RetryConfig};
pub mod exclusive;
pub use exclusive::{ExclusionGuard, KeyedExclusion, KeyedMutex};
