//! Bounded retry with exponential backoff and jitter.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use rand::{thread_rng, Rng};
use std::time::Duration;
use tracing::warn;

static RETRY_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("caia_retry_attempts_total", "Retries executed after a retryable failure", &["operation"])
        .expect("retry counter registers once")
});

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}
impl Default for RetryConfig { fn default() -> Self { Self { max_retries: 3, base_delay: Duration::from_millis(200), max_delay: Duration::from_millis(5000), jitter: 0.25 } } }

impl RetryConfig {
    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt as i32));
        let mut delay = std::cmp::min(exp, self.max_delay);
        if self.jitter > 0.0 {
            let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
            let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
            let base_ms = delay.as_millis() as i64 + offset;
            delay = Duration::from_millis(base_ms.max(0) as u64);
        }
        delay
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// `max_retries` retries have been spent. `op` receives the zero-based attempt.
pub async fn retry_async<F, Fut, T, E, R>(operation: &str, cfg: &RetryConfig, retryable: R, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries || !retryable(&e) => return Err(e),
            Err(e) => {
                let delay = cfg.delay_for(attempt);
                RETRY_ATTEMPTS.with_label_values(&[operation]).inc();
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after failure");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}
