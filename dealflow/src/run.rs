use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextHandle;
use crate::error::RunError;
use crate::stage::{StageName, StageResult};

/// Unique identifier of one analysis run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    /// A fresh time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two subjects an analysis compares.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SubjectIds {
    pub target: String,
    pub counterparty: String,
}

impl SubjectIds {
    pub fn new(target: impl Into<String>, counterparty: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            counterparty: counterparty.into(),
        }
    }
}

/// Lifecycle of a run. Terminal states are final.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether the run has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallySucceeded => "partially_succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Pending may only move to Running; Running may only move to a
    /// terminal status; terminal statuses never move.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => next == RunStatus::Running,
            RunStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// One end-to-end execution of the pipeline for a subject pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub run_id: RunId,
    pub subjects: SubjectIds,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub context: Option<ContextHandle>,
    pub stages: BTreeMap<StageName, StageResult>,
    /// Error that drove the run to FAILED, kept for diagnostics.
    pub failure: Option<String>,
}

impl AnalysisRun {
    /// A PENDING run with a fresh id.
    pub fn new(subjects: SubjectIds) -> Self {
        Self::with_id(RunId::new(), subjects)
    }

    pub fn with_id(run_id: RunId, subjects: SubjectIds) -> Self {
        Self {
            run_id,
            subjects,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
            context: None,
            stages: BTreeMap::new(),
            failure: None,
        }
    }

    /// Move to `next`, stamping `finished_at` on a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::InvalidTransition`] when the lifecycle forbids the move.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), RunError> {
        if !self.status.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                run_id: self.run_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Terminal result of `name`, if recorded.
    pub fn stage(&self, name: &StageName) -> Option<&StageResult> {
        self.stages.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_unique() {
        let a = RunId::new();
        let b = RunId::new();
        assert_ne!(a, b);
        assert!(!a.to_string().is_empty());
    }

    #[test]
    fn test_status_moves_forward_only() {
        let mut run = AnalysisRun::new(SubjectIds::new("ACME", "GLOBEX"));
        assert_eq!(run.status, RunStatus::Pending);

        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::PartiallySucceeded).unwrap();
        assert!(run.finished_at.is_some());

        let err = run.transition(RunStatus::Failed).unwrap_err();
        assert!(matches!(err, RunError::InvalidTransition { .. }));
        assert_eq!(run.status, RunStatus::PartiallySucceeded);
    }

    #[test]
    fn test_pending_cannot_skip_running() {
        let mut run = AnalysisRun::new(SubjectIds::new("ACME", "GLOBEX"));
        assert!(run.transition(RunStatus::Succeeded).is_err());
        assert!(run.transition(RunStatus::Pending).is_err());
        assert_eq!(run.status, RunStatus::Pending);
    }

    #[test]
    fn test_running_cannot_reenter_running() {
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
    }
}
