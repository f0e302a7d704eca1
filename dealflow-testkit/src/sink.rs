use async_trait::async_trait;
use dealflow::*;
use parking_lot::Mutex;
use std::sync::Arc;

/// [`ObservabilitySink`] that keeps every published event.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<RunEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// Attempt records published so far.
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match &e.payload {
                RunEventPayload::StageAttempt(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn attempts_for(&self, stage: &str) -> Vec<AttemptRecord> {
        let stage = StageName::from(stage);
        self.attempts()
            .into_iter()
            .filter(|r| r.stage == stage)
            .collect()
    }

    /// Stages in the order their StageFinished events were published.
    pub fn finished_stages(&self) -> Vec<(StageName, StageStatus)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match &e.payload {
                RunEventPayload::StageFinished { stage, status, .. } => {
                    Some((stage.clone(), *status))
                }
                _ => None,
            })
            .collect()
    }

    /// Status carried by the RunFinished event, if one was published.
    pub fn run_finished(&self) -> Option<RunStatus> {
        self.events.lock().iter().find_map(|e| match &e.payload {
            RunEventPayload::RunFinished { status } => Some(*status),
            _ => None,
        })
    }

    pub fn assert_event_count_eq(&self, expected: usize) {
        let actual = self.events.lock().len();
        assert_eq!(actual, expected, "Expected {expected} events, got {actual}");
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl std::fmt::Debug for RecordingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSink")
            .field("events", &self.events.lock().len())
            .finish()
    }
}

#[async_trait]
impl ObservabilitySink for RecordingSink {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
