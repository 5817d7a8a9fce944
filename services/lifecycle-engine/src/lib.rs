//! Model lifecycle engine: content-addressed artifact cache, eval run
//! coordination and the gated promotion state machine, served over HTTP.

pub mod api;
pub mod artifact_cache;
pub mod config;
pub mod error;
pub mod eval;
pub mod metrics;
pub mod model;
pub mod promotion;
pub mod registry;
pub mod runner;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use caia_core::KeyedMutex;

pub use artifact_cache::{ArtifactCache, ArtifactPin, ResolveRequest, ResolvedArtifact};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use eval::{EvalCoordinator, EvalSettings, StartEval};
pub use model::{EvalRun, Model, ModelStatus};
pub use promotion::{GateReport, GateRequest, GatedPromotion, PromotionEngine};
pub use registry::{HttpRegistry, MemoryRegistry, Registry};
pub use runner::{EvalRunner, ProcessRunner};

/// The wired components shared by every request handler.
pub struct Engine {
    pub registry: Arc<dyn Registry>,
    pub cache: ArtifactCache,
    pub evals: Arc<EvalCoordinator>,
    pub promotions: Arc<PromotionEngine>,
}

impl Engine {
    pub fn new(registry: Arc<dyn Registry>, cache: ArtifactCache, runner: Arc<dyn EvalRunner>, eval: EvalSettings) -> Result<Self> {
        let evals = Arc::new(EvalCoordinator::new(registry.clone(), cache.clone(), runner, eval, Arc::new(KeyedMutex::new()))?);
        let promotions = Arc::new(PromotionEngine::new(registry.clone(), evals.clone()));
        Ok(Self { registry, cache, evals, promotions })
    }

    pub fn from_config(cfg: &EngineConfig) -> anyhow::Result<Self> {
        let registry: Arc<dyn Registry> = if cfg.registry.in_memory {
            let reg = match &cfg.registry.seed_file {
                Some(path) => MemoryRegistry::from_seed_file(path).with_context(|| format!("seeding registry from {}", path.display()))?,
                None => MemoryRegistry::new(),
            };
            info!("using in-memory registry");
            Arc::new(reg)
        } else {
            let reg = HttpRegistry::new(
                &cfg.registry.url,
                cfg.registry.api_key.clone(),
                Duration::from_secs(cfg.registry.timeout_secs),
                Duration::from_secs(cfg.registry.connect_timeout_secs),
            )
            .context("building registry client")?;
            info!(url = reg.base_url(), auth_configured = reg.auth_configured(), "using HTTP registry");
            Arc::new(reg)
        };

        let source = artifact_cache::DefaultSource::new(Duration::from_secs(cfg.cache.connect_timeout_secs)).context("building artifact http client")?;
        let cache = ArtifactCache::open(cfg.cache_settings(), Arc::new(source)).context("opening artifact cache")?;
        let runner = ProcessRunner::new(cfg.eval.program.clone(), cfg.eval.args.clone(), cfg.eval.working_dir.clone());
        Self::new(registry, cache, Arc::new(runner), cfg.eval_settings()).context("wiring engine")
    }
}
