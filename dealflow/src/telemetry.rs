//! Tracing and telemetry instrumentation for dealflow.
//!
//! Span constructors and record helpers used by the stage client and the
//! orchestrator. Every record helper logs through `tracing` and, with the
//! `metrics` feature, also updates the Prometheus collectors in
//! [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use dealflow::telemetry::{record_stage_start, stage_span};
//!
//! let span = stage_span(run_id.to_string(), "valuation:dcf");
//! let _enter = span.enter();
//! let timing = record_stage_start("valuation:dcf");
//! // ... invoke stage
//! record_stage_finished(timing, run_id.to_string(), "succeeded");
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{info_span, Instrument, Span};

/// Span covering one whole run.
#[must_use]
pub fn run_span(run_id: impl AsRef<str>, target: impl AsRef<str>, counterparty: impl AsRef<str>) -> Span {
    info_span!(
        "dealflow.run",
        run_id = %run_id.as_ref(),
        target = %target.as_ref(),
        counterparty = %counterparty.as_ref(),
    )
}

/// Span covering every attempt of one stage.
#[must_use]
pub fn stage_span(run_id: impl AsRef<str>, stage: impl AsRef<str>) -> Span {
    info_span!(
        "dealflow.stage",
        run_id = %run_id.as_ref(),
        stage = %stage.as_ref(),
    )
}

/// Span covering a single network attempt.
#[must_use]
pub fn attempt_span(stage: impl AsRef<str>, attempt: u32) -> Span {
    info_span!(
        "dealflow.attempt",
        stage = %stage.as_ref(),
        attempt = attempt,
    )
}

/// Span covering a rate limiter acquisition.
#[must_use]
pub fn rate_limit_span(endpoint: impl AsRef<str>) -> Span {
    info_span!("dealflow.rate_limit", endpoint = %endpoint.as_ref())
}

/// Attach a stage span to a future.
pub fn instrument_stage<F>(
    run_id: impl AsRef<str>,
    stage: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(stage_span(run_id, stage))
}

/// Record one stage attempt.
pub fn record_attempt(
    run_id: impl AsRef<str>,
    stage: impl AsRef<str>,
    attempt: u32,
    latency: Duration,
    outcome: impl AsRef<str>,
) {
    tracing::info!(
        run_id = %run_id.as_ref(),
        stage = %stage.as_ref(),
        attempt = attempt,
        latency_ms = latency.as_millis() as u64,
        outcome = %outcome.as_ref(),
        "stage attempt finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_stage_attempt(stage.as_ref(), outcome.as_ref());
}

/// Record a stage reaching a terminal status.
pub fn record_stage_finished(
    handle: StageTimingHandle,
    run_id: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    let elapsed = handle.elapsed();
    tracing::info!(
        run_id = %run_id.as_ref(),
        stage = %handle.stage(),
        status = %status.as_ref(),
        duration_ms = elapsed.as_millis() as u64,
        "stage finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_stage_latency(handle.stage(), elapsed.as_secs_f64());
}

/// Record a run reaching its terminal status.
pub fn record_run_finished(run_id: impl AsRef<str>, status: impl AsRef<str>, duration: Duration) {
    tracing::info!(
        run_id = %run_id.as_ref(),
        status = %status.as_ref(),
        duration_ms = duration.as_millis() as u64,
        "run finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_completed(status.as_ref());
}

/// Record time a caller spent waiting on the rate limiter.
pub fn record_rate_limit_wait(waited: Duration) {
    tracing::debug!(waited_ms = waited.as_millis() as u64, "rate limiter delayed call");

    #[cfg(feature = "metrics")]
    crate::metrics::observe_rate_limit_wait(waited.as_secs_f64());
}

/// Start timing a stage.
pub fn record_stage_start(stage: impl AsRef<str>) -> StageTimingHandle {
    StageTimingHandle {
        stage: stage.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Opaque handle returned by [`record_stage_start`].
#[derive(Debug)]
pub struct StageTimingHandle {
    stage: String,
    start: std::time::Instant,
}

impl StageTimingHandle {
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
