use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorClass, StageError};

/// Name of a stage in a pipeline graph, e.g. `valuation:dcf`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageName(String);

impl StageName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StageName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StageName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Name of a group of sibling stages evaluated under a quorum rule.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseName(String);

impl PhaseName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PhaseName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PhaseName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How a stage failure affects the rest of the run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure aborts the run.
    Critical,
    /// Failure is recorded as a degraded skip.
    Degradable,
    /// Failure is logged; dependents treat the output as absent.
    Optional,
}

impl Criticality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Critical => "critical",
            Criticality::Degradable => "degradable",
            Criticality::Optional => "optional",
        }
    }
}

/// Stage lifecycle. Everything past RUNNING is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
        }
    }
}

/// Why a stage ended up SKIPPED.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A gating dependency produced nothing to work with.
    GateClosed { dependency: StageName },
    /// A required dependency did not succeed.
    DependencyUnmet {
        dependency: StageName,
        by_design: bool,
    },
    /// Too few members of a phase succeeded.
    QuorumUnmet {
        phase: PhaseName,
        succeeded: usize,
        required: usize,
    },
    /// The stage itself failed and was degraded instead of failing the run.
    Degraded { class: ErrorClass },
}

impl SkipReason {
    /// True when the skip is an expected outcome of the graph rather than
    /// the consequence of a failure somewhere upstream.
    pub fn is_by_design(&self) -> bool {
        match self {
            SkipReason::GateClosed { .. } => true,
            SkipReason::DependencyUnmet { by_design, .. } => *by_design,
            SkipReason::QuorumUnmet { .. } | SkipReason::Degraded { .. } => false,
        }
    }

    /// Reason code shown in report sections, e.g. `gate-closed:identify_peers`.
    pub fn reason_code(&self) -> String {
        match self {
            SkipReason::GateClosed { dependency } => format!("gate-closed:{dependency}"),
            SkipReason::DependencyUnmet { dependency, .. } => {
                format!("dependency-unmet:{dependency}")
            }
            SkipReason::QuorumUnmet { phase, .. } => format!("quorum-unmet:{phase}"),
            SkipReason::Degraded { class } => format!("stage-failed:{class}"),
        }
    }
}

/// Final, immutable record of one stage within a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub status: StageStatus,
    pub success: bool,
    /// Set when the stage was skipped by a degradable failure (its own or a
    /// dependency's).
    pub degraded: bool,
    pub payload: Option<Value>,
    pub error: Option<StageError>,
    pub skip: Option<SkipReason>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// A skip that the graph planned for (e.g. no peers found).
    pub fn is_skipped_by_design(&self) -> bool {
        self.status == StageStatus::Skipped
            && self.skip.as_ref().is_some_and(SkipReason::is_by_design)
    }

    /// Skipped or failed because something went wrong.
    pub fn is_failure(&self) -> bool {
        match self.status {
            StageStatus::Failed | StageStatus::Cancelled => true,
            StageStatus::Skipped => !self.is_skipped_by_design(),
            _ => false,
        }
    }

    /// Build a skip result for a stage that never started.
    pub fn skipped(stage: StageName, reason: SkipReason, error: Option<StageError>) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            success: false,
            degraded: !reason.is_by_design(),
            payload: None,
            error,
            skip: Some(reason),
            attempts: 0,
            started_at: None,
            finished_at: Utc::now(),
        }
    }
}

/// Mutable execution record owned by the orchestrator while a stage runs.
#[derive(Clone, Debug)]
pub struct StageInvocation {
    pub stage: StageName,
    pub attempts: u32,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorClass>,
}

impl StageInvocation {
    /// A PENDING invocation with no attempts.
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            attempts: 0,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    /// Mark RUNNING and stamp the start time.
    pub fn start(&mut self) {
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Close as SUCCEEDED with `payload`.
    pub fn succeed(mut self, attempts: u32, payload: Value) -> StageResult {
        self.attempts = attempts;
        self.finish(StageStatus::Succeeded);
        self.into_result(Some(payload), None, None)
    }

    /// Close as FAILED with `error`.
    pub fn fail(mut self, attempts: u32, error: StageError) -> StageResult {
        self.attempts = attempts;
        self.last_error = Some(error.class());
        self.finish(StageStatus::Failed);
        self.into_result(None, Some(error), None)
    }

    /// Record a failure that the stage's criticality turns into a skip.
    pub fn degrade(mut self, attempts: u32, error: StageError) -> StageResult {
        self.attempts = attempts;
        let class = error.class();
        self.last_error = Some(class);
        self.finish(StageStatus::Skipped);
        self.into_result(None, Some(error), Some(SkipReason::Degraded { class }))
    }

    /// Close as CANCELLED after `attempts` attempts.
    pub fn cancel(mut self, attempts: u32) -> StageResult {
        self.attempts = attempts;
        self.last_error = Some(ErrorClass::Cancelled);
        self.finish(StageStatus::Cancelled);
        self.into_result(None, Some(StageError::Cancelled), None)
    }

    fn finish(&mut self, status: StageStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    fn into_result(
        self,
        payload: Option<Value>,
        error: Option<StageError>,
        skip: Option<SkipReason>,
    ) -> StageResult {
        StageResult {
            success: self.status == StageStatus::Succeeded,
            degraded: skip.is_some(),
            stage: self.stage,
            status: self.status,
            payload,
            error,
            skip,
            attempts: self.attempts,
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        for status in [
            StageStatus::Succeeded,
            StageStatus::Failed,
            StageStatus::Skipped,
            StageStatus::Cancelled,
        ] {
            assert!(status.is_terminal(), "{status:?} should be terminal");
        }
    }

    #[test]
    fn test_invocation_success_result() {
        let mut inv = StageInvocation::new("model:target".into());
        inv.start();
        let result = inv.succeed(2, json!({"ebitda": 10}));
        assert_eq!(result.status, StageStatus::Succeeded);
        assert!(result.success);
        assert!(!result.degraded);
        assert_eq!(result.attempts, 2);
        assert!(result.started_at.is_some());
        assert_eq!(result.payload, Some(json!({"ebitda": 10})));
    }

    #[test]
    fn test_degrade_marks_skipped_due_to_failure() {
        let mut inv = StageInvocation::new("identify_peers".into());
        inv.start();
        let result = inv.degrade(1, StageError::permanent(None, "no sector"));
        assert_eq!(result.status, StageStatus::Skipped);
        assert!(result.degraded);
        assert!(result.is_failure());
        assert!(!result.is_skipped_by_design());
        assert_eq!(
            result.skip.as_ref().map(SkipReason::reason_code).as_deref(),
            Some("stage-failed:permanent")
        );
    }

    #[test]
    fn test_gate_skip_is_by_design() {
        let result = StageResult::skipped(
            "valuation:cca".into(),
            SkipReason::GateClosed {
                dependency: "identify_peers".into(),
            },
            None,
        );
        assert!(result.is_skipped_by_design());
        assert!(!result.is_failure());
        assert!(!result.degraded);
    }

    #[test]
    fn test_dependency_unmet_inherits_design_flag() {
        let by_design = SkipReason::DependencyUnmet {
            dependency: "valuation:cca".into(),
            by_design: true,
        };
        let by_failure = SkipReason::DependencyUnmet {
            dependency: "classify:target".into(),
            by_design: false,
        };
        assert!(by_design.is_by_design());
        assert!(!by_failure.is_by_design());
    }

    #[test]
    fn test_stage_name_serializes_transparently() {
        let name = StageName::from("valuation:lbo");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"valuation:lbo\"");
    }
}
