//! Prometheus metrics instrumentation for dealflow.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `dealflow_stage_attempts_total` - Stage attempts by stage and outcome
//! - `dealflow_runs_completed_total` - Runs reaching a terminal status
//!
//! ## Histograms
//! - `dealflow_stage_latency_seconds` - Wall time from stage start to terminal status
//! - `dealflow_rate_limit_wait_seconds` - Time callers spent waiting on the rate limiter
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for dealflow metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `stage`, `outcome`.
pub static STAGE_ATTEMPTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("dealflow_stage_attempts_total", "Total number of stage attempts");
    CounterVec::new(opts, &["stage", "outcome"])
        .expect("dealflow_stage_attempts_total metric creation failed")
});

/// Labels: `status`.
pub static RUNS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "dealflow_runs_completed_total",
        "Total number of runs reaching a terminal status",
    );
    CounterVec::new(opts, &["status"]).expect("dealflow_runs_completed_total metric creation failed")
});

/// Labels: `stage`.
pub static STAGE_LATENCY_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.005, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "dealflow_stage_latency_seconds",
        "Stage wall time from start to terminal status",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["stage"]).expect("dealflow_stage_latency_seconds metric creation failed")
});

pub static RATE_LIMIT_WAIT_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 14).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "dealflow_rate_limit_wait_seconds",
        "Time callers spent waiting for a rate limiter slot",
    )
    .buckets(buckets);
    Histogram::with_opts(opts).expect("dealflow_rate_limit_wait_seconds metric creation failed")
});

/// Register all collectors with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(STAGE_ATTEMPTS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(RUNS_COMPLETED_TOTAL.clone()),
        Box::new(STAGE_LATENCY_SECONDS.clone()),
        Box::new(RATE_LIMIT_WAIT_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_stage_attempt(stage: &str, outcome: &str) {
    STAGE_ATTEMPTS_TOTAL.with_label_values(&[stage, outcome]).inc();
}

pub fn record_run_completed(status: &str) {
    RUNS_COMPLETED_TOTAL.with_label_values(&[status]).inc();
}

pub fn observe_stage_latency(stage: &str, secs: f64) {
    STAGE_LATENCY_SECONDS.with_label_values(&[stage]).observe(secs);
}

pub fn observe_rate_limit_wait(secs: f64) {
    RATE_LIMIT_WAIT_SECONDS.observe(secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics().expect("first init");
        init_metrics().expect("second init");
    }

    #[test]
    fn test_gather_contains_recorded_series() {
        init_metrics().expect("metrics initialization should succeed");

        record_stage_attempt("valuation:dcf", "succeeded");
        record_run_completed("succeeded");
        observe_stage_latency("valuation:dcf", 0.25);
        observe_rate_limit_wait(1.5);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("dealflow_stage_attempts_total"));
        assert!(output.contains("dealflow_runs_completed_total"));
        assert!(output.contains("dealflow_stage_latency_seconds"));
        assert!(output.contains("dealflow_rate_limit_wait_seconds"));
    }
}
