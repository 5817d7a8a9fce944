use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter, IntCounterVec};

pub static PROMOTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("caia_promotions_total", "Successful status transitions", &["mode"]).expect("register caia_promotions_total")
});

pub static GATE_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("caia_gate_attempts_total", "Gate checks by outcome", &["outcome"]).expect("register caia_gate_attempts_total")
});

pub static EVAL_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("caia_eval_runs_total", "Eval runs by outcome", &["outcome"]).expect("register caia_eval_runs_total")
});

pub static EVAL_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "caia_eval_duration_seconds",
        "Wall time of eval runs",
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]
    )
    .expect("register caia_eval_duration_seconds")
});

pub static ARTIFACT_RESOLVES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("caia_artifact_resolves_total", "Artifact resolutions by outcome", &["outcome"])
        .expect("register caia_artifact_resolves_total")
});

pub static ARTIFACT_FETCHED_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("caia_artifact_fetched_bytes_total", "Bytes installed into the artifact cache").expect("register caia_artifact_fetched_bytes_total")
});

pub static ARTIFACT_EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("caia_artifact_evictions_total", "Cache entries evicted to stay under budget").expect("register caia_artifact_evictions_total")
});
