use async_trait::async_trait;
use dealflow::*;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::fixtures;

pub type Reply = Result<TransportResponse, TransportError>;

/// One call observed by a [`ScriptedTransport`].
#[derive(Clone, Debug)]
pub struct CallRecord {
    pub stage: StageName,
    pub endpoint: String,
    pub attempt: u32,
    pub auth_token: Option<String>,
    pub body: Value,
    pub started: Instant,
    /// `None` when the call was abandoned before the reply was produced.
    pub finished: Option<Instant>,
}

#[derive(Clone, Debug, Default)]
struct Script {
    replies: VecDeque<Reply>,
    fallback: Option<Reply>,
    delay: Duration,
}

/// In-memory [`StageTransport`] answering per stage from a script.
///
/// Unscripted stages succeed with [`fixtures::default_payload`]. Scripted
/// replies are handed out in order; once exhausted the stage's fallback (or
/// the default success) is used.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    scripts: Arc<Mutex<HashMap<StageName, Script>>>,
    calls: Arc<Mutex<Vec<CallRecord>>>,
}

impl ScriptedTransport {
    /// A transport answering every unscripted stage with its default payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next call to `stage`.
    pub fn reply(&self, stage: &str, reply: Reply) -> &Self {
        self.scripts
            .lock()
            .entry(stage.into())
            .or_default()
            .replies
            .push_back(reply);
        self
    }

    /// Answer every call to `stage` with `reply` once queued replies run out.
    pub fn always(&self, stage: &str, reply: Reply) -> &Self {
        self.scripts.lock().entry(stage.into()).or_default().fallback = Some(reply);
        self
    }

    /// Answer every attempt at `stage` with `payload`.
    pub fn ok(&self, stage: &str, payload: Value) -> &Self {
        self.always(stage, Ok(TransportResponse::ok(payload)))
    }

    /// Answer every attempt at `stage` with an error envelope.
    pub fn fail_permanently(&self, stage: &str, code: &str) -> &Self {
        self.always(stage, Ok(fixtures::error_envelope(code, "scripted failure")))
    }

    /// Delay every reply for `stage`.
    pub fn delay(&self, stage: &str, delay: Duration) -> &Self {
        self.scripts.lock().entry(stage.into()).or_default().delay = delay;
        self
    }

    /// Every attempt sent so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, stage: &str) -> Vec<CallRecord> {
        let stage = StageName::from(stage);
        self.calls
            .lock()
            .iter()
            .filter(|c| c.stage == stage)
            .cloned()
            .collect()
    }

    /// Attempts sent to `stage`.
    pub fn call_count(&self, stage: &str) -> usize {
        self.calls_for(stage).len()
    }

    pub fn was_called(&self, stage: &str) -> bool {
        self.call_count(stage) > 0
    }

    /// Assert that every call to `first` finished before any call to `then` started.
    pub fn assert_finished_before(&self, first: &str, then: &str) {
        let first_calls = self.calls_for(first);
        let then_calls = self.calls_for(then);
        assert!(!first_calls.is_empty(), "{first} was never called");
        for later in &then_calls {
            for earlier in &first_calls {
                let finished = earlier
                    .finished
                    .unwrap_or_else(|| panic!("{first} call never finished"));
                assert!(
                    finished <= later.started,
                    "{then} started before {first} finished"
                );
            }
        }
    }

    fn next_reply(&self, stage: &StageName) -> (Reply, Duration) {
        let mut scripts = self.scripts.lock();
        let Some(script) = scripts.get_mut(stage) else {
            return (
                Ok(TransportResponse::ok(fixtures::default_payload(stage.as_str()))),
                Duration::ZERO,
            );
        };
        let reply = script
            .replies
            .pop_front()
            .or_else(|| script.fallback.clone())
            .unwrap_or_else(|| Ok(TransportResponse::ok(fixtures::default_payload(stage.as_str()))));
        (reply, script.delay)
    }
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("scripted_stages", &self.scripts.lock().len())
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

#[async_trait]
impl StageTransport for ScriptedTransport {
    async fn send(&self, endpoint: &Endpoint, request: TransportRequest) -> Reply {
        let stage: StageName = request
            .body
            .get("stage")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .into();

        let index = {
            let mut calls = self.calls.lock();
            calls.push(CallRecord {
                stage: stage.clone(),
                endpoint: endpoint.name.clone(),
                attempt: request.attempt,
                auth_token: request.auth_token.clone(),
                body: request.body.clone(),
                started: Instant::now(),
                finished: None,
            });
            calls.len() - 1
        };

        let (reply, delay) = self.next_reply(&stage);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(call) = self.calls.lock().get_mut(index) {
            call.finished = Some(Instant::now());
        }
        reply
    }
}
