use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ErrorClass;
use crate::run::{RunId, RunStatus, SubjectIds};
use crate::stage::{StageName, StageStatus};

/// Metadata envelope attached to every run event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub run_id: RunId,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    /// Version-1 metadata stamped with the current time.
    pub fn new(run_id: RunId, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            run_id,
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of a single network attempt against a stage endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { class: ErrorClass, will_retry: bool },
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed { class, .. } => class.as_str(),
        }
    }
}

/// Structured per-attempt record handed to the observability sink.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub run_id: RunId,
    pub stage: StageName,
    pub attempt: u32,
    pub latency_ms: u64,
    pub outcome: AttemptOutcome,
}

/// Envelope published to the observability sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub meta: EventMeta,
    pub payload: RunEventPayload,
}

impl RunEvent {
    pub fn new(run_id: RunId, idempotency_key: impl Into<String>, payload: RunEventPayload) -> Self {
        Self {
            meta: EventMeta::new(run_id, idempotency_key),
            payload,
        }
    }

    /// Wrap an attempt record, keyed by stage and attempt number.
    pub fn attempt(record: AttemptRecord) -> Self {
        let key = format!("attempt-{}-{}", record.stage, record.attempt);
        Self::new(record.run_id, key, RunEventPayload::StageAttempt(record))
    }
}

/// Event payload emitted for run and stage lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunEventPayload {
    RunStarted {
        subjects: SubjectIds,
    },
    StageStarted {
        stage: StageName,
    },
    StageAttempt(AttemptRecord),
    StageFinished {
        stage: StageName,
        status: StageStatus,
        attempts: u32,
    },
    RunFinished {
        status: RunStatus,
    },
}

/// External collaborator receiving structured run telemetry.
#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()>;
}

/// Sink that only writes events to the tracing subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl ObservabilitySink for TracingSink {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()> {
        let run_id = event.meta.run_id;
        match &event.payload {
            RunEventPayload::StageAttempt(record) => {
                tracing::debug!(
                    run_id = %run_id,
                    stage = %record.stage,
                    attempt = record.attempt,
                    latency_ms = record.latency_ms,
                    outcome = record.outcome.as_str(),
                    "stage attempt"
                );
            }
            RunEventPayload::RunFinished { status } => {
                tracing::info!(run_id = %run_id, status = status.as_str(), "run event: finished");
            }
            other => {
                tracing::trace!(run_id = %run_id, event = ?other, "run event");
            }
        }
        Ok(())
    }
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for slow subscribers; a subscriber that falls more
/// than `capacity` events behind receives `RecvError::Lagged`.
pub struct InProcEventBus {
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    ///
    /// Lagging subscribers lose the oldest events; publishers never block.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl ObservabilitySink for InProcEventBus {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()> {
        // no subscribers is not an error
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(attempt: u32) -> AttemptRecord {
        AttemptRecord {
            run_id: RunId::new(),
            stage: "ingest:target".into(),
            attempt,
            latency_ms: 12,
            outcome: AttemptOutcome::Failed {
                class: ErrorClass::Transient,
                will_retry: true,
            },
        }
    }

    #[tokio::test]
    async fn test_bus_fans_out_to_all_subscribers() {
        let bus = InProcEventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(RunEvent::attempt(record(1))).await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            match event.payload {
                RunEventPayload::StageAttempt(r) => assert_eq!(r.attempt, 1),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(4);
        assert!(bus.publish(RunEvent::attempt(record(1))).await.is_ok());
        assert!(TracingSink.publish(RunEvent::attempt(record(2))).await.is_ok());
    }

    #[test]
    fn test_attempt_record_serializes_flat_outcome() {
        let json = serde_json::to_value(record(2)).unwrap();
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["outcome"]["outcome"], "failed");
        assert_eq!(json["outcome"]["class"], "transient");
    }
}
