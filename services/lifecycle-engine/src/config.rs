//! Service configuration, loaded through `caia_core::load_config`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use caia_core::RetryConfig;

use crate::artifact_cache::CacheSettings;
use crate::eval::EvalSettings;

/// Keys whose `CAIA__...` environment values are comma separated.
pub const LIST_KEYS: &[&str] = &["eval.args", "eval.allowed_suites"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub listen_addr: String,
    pub health_port: u16,
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    pub eval: EvalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Serve from an in-process registry instead of `url`.
    pub in_memory: bool,
    /// JSON array of models loaded into the in-process registry.
    pub seed_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub max_concurrent_fetches: usize,
    pub fetch_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub retry: RetrySection,
    pub s3_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub runs_dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub inference_url: String,
    pub allowed_suites: Vec<String>,
    pub default_timeout_secs: u64,
    pub default_max_tokens: Option<u32>,
    pub default_temperature: Option<f64>,
    /// Forwarded to the runner as its per-request inference timeout.
    pub default_request_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8090".into(),
            health_port: 9095,
            registry: RegistryConfig::default(),
            cache: CacheConfig::default(),
            eval: EvalConfig::default(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8001".into(),
            api_key: None,
            timeout_secs: 30,
            connect_timeout_secs: 3,
            in_memory: false,
            seed_file: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./artifact-cache"),
            max_bytes: 50 * 1024 * 1024 * 1024,
            max_concurrent_fetches: 4,
            fetch_timeout_secs: 1800,
            connect_timeout_secs: 10,
            retry: RetrySection::default(),
            s3_endpoint: None,
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self { Self { max_retries: 3, base_delay_ms: 200, max_delay_ms: 5000 } }
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("./eval_runs"),
            program: "python3".into(),
            args: vec!["-m".into(), "caiatech_eval_service.runner".into()],
            working_dir: None,
            inference_url: "http://127.0.0.1:8000".into(),
            allowed_suites: vec!["smoke-v1".into(), "core-v1".into(), "math-corpus-v1".into()],
            default_timeout_secs: 3600,
            default_max_tokens: None,
            default_temperature: None,
            default_request_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        let cfg: Self = caia_core::load_config(LIST_KEYS).context("loading lifecycle-engine config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr.parse::<SocketAddr>().with_context(|| format!("invalid listen_addr {}", self.listen_addr))?;
        if self.cache.max_bytes == 0 { bail!("cache.max_bytes must be positive"); }
        if self.cache.max_concurrent_fetches == 0 { bail!("cache.max_concurrent_fetches must be at least 1"); }
        if self.cache.fetch_timeout_secs == 0 { bail!("cache.fetch_timeout_secs must be positive"); }
        if self.eval.allowed_suites.iter().all(|s| s.trim().is_empty()) { bail!("eval.allowed_suites must name at least one suite"); }
        if self.eval.default_timeout_secs == 0 { bail!("eval.default_timeout_secs must be positive"); }
        if self.eval.program.trim().is_empty() { bail!("eval.program must be set"); }
        if !self.registry.in_memory && self.registry.url.trim().is_empty() { bail!("registry.url must be set unless registry.in_memory"); }
        Ok(())
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            dir: self.cache.dir.clone(),
            max_bytes: self.cache.max_bytes,
            max_concurrent_fetches: self.cache.max_concurrent_fetches,
            fetch_timeout: Duration::from_secs(self.cache.fetch_timeout_secs),
            retry: RetryConfig {
                max_retries: self.cache.retry.max_retries,
                base_delay: Duration::from_millis(self.cache.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.cache.retry.max_delay_ms),
                ..RetryConfig::default()
            },
            s3_endpoint: self.cache.s3_endpoint.clone(),
        }
    }

    pub fn eval_settings(&self) -> EvalSettings {
        EvalSettings {
            runs_dir: self.eval.runs_dir.clone(),
            inference_url: self.eval.inference_url.clone(),
            allowed_suites: self.eval.allowed_suites.iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
            default_timeout: Duration::from_secs(self.eval.default_timeout_secs),
            default_max_tokens: self.eval.default_max_tokens,
            default_temperature: self.eval.default_temperature,
            default_request_timeout_secs: self.eval.default_request_timeout_secs.filter(|s| *s > 0),
        }
    }
}
