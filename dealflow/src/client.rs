//! Rate-limited, retrying client for remote stage endpoints.
//!
//! [`StageClient::invoke`] turns one logical stage call into one or more
//! network attempts against a [`StageTransport`], classifying every failure
//! as transient or permanent and emitting an [`AttemptRecord`] per attempt.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::Instrument;

use crate::context::ContextHandle;
use crate::error::{ErrorClass, StageError};
use crate::events::{AttemptOutcome, AttemptRecord, ObservabilitySink, RunEvent};
use crate::graph::Endpoint;
use crate::rate_limit::RateLimiter;
use crate::retry::{compute_backoff, should_retry, RetryPolicy};
use crate::run::{RunId, SubjectIds};
use crate::runtime::CancelToken;
use crate::stage::StageName;
use crate::telemetry;

/// Envelope `error_code`s that indicate a transient upstream condition.
pub const TRANSIENT_ERROR_CODES: &[&str] = &["RATE_LIMITED", "UNAVAILABLE", "TIMEOUT", "INTERNAL"];

/// Body sent to every stage endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    pub run_id: RunId,
    pub stage: StageName,
    pub subjects: SubjectIds,
    pub context_handle: Option<ContextHandle>,
    /// Payloads of successful upstream stages, keyed by stage name.
    pub stage_inputs: BTreeMap<StageName, Value>,
}

/// Response envelope returned by stage endpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageResponse {
    Ok {
        payload: Value,
    },
    Error {
        error_code: String,
        #[serde(default)]
        message: String,
    },
}

/// Wire request handed to a [`StageTransport`] for a single attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportRequest {
    pub body: Value,
    pub auth_token: Option<String>,
    pub attempt: u32,
}

/// Raw reply from a stage endpoint.
///
/// Classified by [`classify_response`]: 429 and 5xx statuses are transient,
/// and a 2xx body must hold a success or error envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportResponse {
    /// HTTP-style status code.
    pub status: u16,
    pub body: Value,
}

impl TransportResponse {
    /// Build a response from a status code and an arbitrary body.
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// A 200 reply wrapping `payload` in the success envelope.
    pub fn ok(payload: Value) -> Self {
        Self::new(200, serde_json::json!({"status": "ok", "payload": payload}))
    }
}

/// Failure to obtain any reply. Always classified as transient.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
}

/// Request/response channel to a stage endpoint.
#[async_trait]
pub trait StageTransport: Send + Sync {
    /// Send one attempt to `endpoint`. Implementations must not retry.
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError>;
}

/// Supplies per-call credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Token for `endpoint`, or `None` when the call is unauthenticated.
    async fn token(&self, endpoint: &Endpoint) -> anyhow::Result<Option<String>>;
}

/// Hands out the same token for every endpoint.
#[derive(Clone)]
pub struct StaticCredentials {
    token: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl StaticCredentials {
    /// Use `token` for every call. It is never written to `Debug` output.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn token(&self, _endpoint: &Endpoint) -> anyhow::Result<Option<String>> {
        Ok(Some(self.token.clone()))
    }
}

/// For endpoints that need no authentication.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn token(&self, _endpoint: &Endpoint) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// One logical stage call.
#[derive(Clone, Debug)]
pub struct StageCall {
    pub endpoint: Endpoint,
    pub request: StageRequest,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub cancel: CancelToken,
}

/// Result of [`StageClient::invoke`].
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub attempts: u32,
    /// Sum of backoff sleeps between attempts.
    pub total_backoff: Duration,
    pub outcome: Result<Value, StageError>,
}

/// Invokes stage endpoints, retrying transient failures under a per-attempt
/// timeout until the call's token is cancelled.
///
/// Every attempt is reported to the observability sink as an
/// [`AttemptRecord`](crate::AttemptRecord), including attempts abandoned
/// because the run was cancelled. Calls to rate-governed endpoints first
/// acquire a slot from the shared limiter when one is configured.
pub struct StageClient {
    transport: Arc<dyn StageTransport>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    credentials: Arc<dyn CredentialProvider>,
    sink: Arc<dyn ObservabilitySink>,
}

impl std::fmt::Debug for StageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageClient")
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}

impl StageClient {
    /// Create a client without a rate limiter.
    ///
    /// # Arguments
    ///
    /// * `transport` - Channel used to reach stage endpoints.
    /// * `credentials` - Looked up once per attempt, inside the attempt timeout.
    /// * `sink` - Receives one attempt record per attempt.
    pub fn new(
        transport: Arc<dyn StageTransport>,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        Self {
            transport,
            rate_limiter: None,
            credentials,
            sink,
        }
    }

    /// Gate rate-governed endpoints on `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Invoke a stage, retrying transient failures per `call.retry`.
    ///
    /// Never panics and never returns early without an outcome: every path
    /// yields an [`Invocation`].
    pub async fn invoke(&self, call: StageCall) -> Invocation {
        let run_id = call.request.run_id;
        let stage = call.request.stage.clone();
        let mut attempts = 0u32;
        let mut total_backoff = Duration::ZERO;

        let body = match serde_json::to_value(&call.request) {
            Ok(body) => body,
            Err(e) => {
                return Invocation {
                    attempts,
                    total_backoff,
                    outcome: Err(StageError::permanent(
                        Some("INVALID_REQUEST".into()),
                        e.to_string(),
                    )),
                }
            }
        };

        let finish = |attempts, total_backoff, outcome| Invocation {
            attempts,
            total_backoff,
            outcome,
        };

        loop {
            if call.cancel.is_cancelled() {
                return finish(attempts, total_backoff, Err(StageError::Cancelled));
            }
            attempts += 1;

            let started = Instant::now();
            if call.endpoint.rate_governed {
                if let Some(limiter) = &self.rate_limiter {
                    let acquire = limiter
                        .acquire()
                        .instrument(telemetry::rate_limit_span(&call.endpoint.name));
                    tokio::select! {
                        biased;
                        _ = call.cancel.cancelled() => {
                            self.record_cancelled(run_id, &stage, attempts, started.elapsed()).await;
                            return finish(attempts, total_backoff, Err(StageError::Cancelled));
                        }
                        _ = acquire => {}
                    }
                }
            }

            let started = Instant::now();
            let timed = tokio::time::timeout(call.timeout, self.attempt(&call.endpoint, &body, attempts))
                .instrument(telemetry::attempt_span(&stage, attempts));
            let result = tokio::select! {
                biased;
                _ = call.cancel.cancelled() => {
                    tracing::debug!(run_id = %run_id, stage = %stage, attempt = attempts, "attempt abandoned on cancellation");
                    self.record_cancelled(run_id, &stage, attempts, started.elapsed()).await;
                    return finish(attempts, total_backoff, Err(StageError::Cancelled));
                }
                attempted = timed => attempted.unwrap_or_else(|_| {
                    Err(StageError::transient(format!(
                        "attempt timed out after {}ms",
                        call.timeout.as_millis()
                    )))
                }),
            };
            let latency = started.elapsed();

            match result {
                Ok(payload) => {
                    self.record(run_id, &stage, attempts, latency, AttemptOutcome::Succeeded)
                        .await;
                    return finish(attempts, total_backoff, Ok(payload));
                }
                Err(err) if err.is_retryable() && should_retry(attempts, call.retry.max_attempts) => {
                    self.record(
                        run_id,
                        &stage,
                        attempts,
                        latency,
                        AttemptOutcome::Failed {
                            class: err.class(),
                            will_retry: true,
                        },
                    )
                    .await;

                    let delay = compute_backoff(attempts, &call.retry);
                    tracing::warn!(
                        run_id = %run_id,
                        stage = %stage,
                        attempt = attempts,
                        max_attempts = call.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient stage failure, will retry"
                    );
                    tokio::select! {
                        biased;
                        _ = call.cancel.cancelled() => {
                            return finish(attempts, total_backoff, Err(StageError::Cancelled));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    total_backoff += delay;
                }
                Err(err) => {
                    self.record(
                        run_id,
                        &stage,
                        attempts,
                        latency,
                        AttemptOutcome::Failed {
                            class: err.class(),
                            will_retry: false,
                        },
                    )
                    .await;

                    let err = if err.is_retryable() {
                        tracing::error!(
                            run_id = %run_id,
                            stage = %stage,
                            attempts,
                            error = %err,
                            "retries exhausted"
                        );
                        StageError::TransientExhausted {
                            attempts,
                            last: err.to_string(),
                        }
                    } else {
                        tracing::error!(
                            run_id = %run_id,
                            stage = %stage,
                            attempt = attempts,
                            error = %err,
                            "non-retryable stage failure"
                        );
                        err
                    };
                    return finish(attempts, total_backoff, Err(err));
                }
            }
        }
    }

    /// One network attempt: credential lookup, send and classification.
    /// The caller bounds it with the per-attempt timeout.
    async fn attempt(&self, endpoint: &Endpoint, body: &Value, attempt: u32) -> Result<Value, StageError> {
        let auth_token = self
            .credentials
            .token(endpoint)
            .await
            .map_err(|e| StageError::Credential(e.to_string()))?;
        let request = TransportRequest {
            body: body.clone(),
            auth_token,
            attempt,
        };
        match self.transport.send(endpoint, request).await {
            Ok(response) => classify_response(response),
            Err(e) => Err(StageError::transient(e.to_string())),
        }
    }

    async fn record_cancelled(&self, run_id: RunId, stage: &StageName, attempt: u32, latency: Duration) {
        let outcome = AttemptOutcome::Failed {
            class: ErrorClass::Cancelled,
            will_retry: false,
        };
        self.record(run_id, stage, attempt, latency, outcome).await;
    }

    async fn record(
        &self,
        run_id: RunId,
        stage: &StageName,
        attempt: u32,
        latency: Duration,
        outcome: AttemptOutcome,
    ) {
        telemetry::record_attempt(run_id.to_string(), stage, attempt, latency, outcome.as_str());
        let record = AttemptRecord {
            run_id,
            stage: stage.clone(),
            attempt,
            latency_ms: latency.as_millis() as u64,
            outcome,
        };
        if let Err(e) = self.sink.publish(RunEvent::attempt(record)).await {
            tracing::warn!(run_id = %run_id, stage = %stage, error = %e, "failed to publish attempt record");
        }
    }
}

/// Map a transport response onto a payload or a classified error.
pub fn classify_response(response: TransportResponse) -> Result<Value, StageError> {
    match response.status {
        429 => Err(StageError::transient("upstream rate limited (429)")),
        500..=599 => Err(StageError::transient(format!(
            "upstream error ({})",
            response.status
        ))),
        400..=499 => Err(StageError::permanent(
            Some(format!("HTTP_{}", response.status)),
            error_message(&response.body),
        )),
        200..=299 => match serde_json::from_value::<StageResponse>(response.body) {
            Ok(StageResponse::Ok { payload }) => Ok(payload),
            Ok(StageResponse::Error {
                error_code,
                message,
            }) => {
                if TRANSIENT_ERROR_CODES.contains(&error_code.as_str()) {
                    Err(StageError::transient(format!("{error_code}: {message}")))
                } else {
                    Err(StageError::permanent(Some(error_code), message))
                }
            }
            Err(e) => Err(StageError::permanent(
                Some("INVALID_ENVELOPE".into()),
                e.to_string(),
            )),
        },
        other => Err(StageError::permanent(
            Some(format!("HTTP_{other}")),
            "unexpected response status",
        )),
    }
}

fn error_message(body: &Value) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}
