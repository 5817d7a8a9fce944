use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use caia_core::{clear_ready, init_tracing, mark_ready, start_health_server};
use lifecycle_engine::{api, Engine, EngineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("lifecycle-engine")?;

    let cfg = EngineConfig::load()?;
    info!(listen_addr = %cfg.listen_addr, health_port = cfg.health_port, cache_dir = %cfg.cache.dir.display(), "config loaded");

    start_health_server(cfg.health_port).await?;

    let engine = Arc::new(Engine::from_config(&cfg)?);
    let app = api::router(engine);
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    mark_ready();
    info!(addr = %cfg.listen_addr, "service ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            clear_ready();
            info!("shutdown");
        })
        .await?;
    Ok(())
}
