use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::run::{RunId, RunStatus};
use crate::stage::{PhaseName, StageName};

/// Coarse classification of a stage failure.
///
/// This is what gets recorded on a [`StageInvocation`](crate::stage::StageInvocation),
/// emitted in attempt records and used as a report reason code.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Transient,
    TransientExhausted,
    Permanent,
    DependencyUnmet,
    QuorumUnmet,
    ContextExpired,
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::TransientExhausted => "transient-exhausted",
            ErrorClass::Permanent => "permanent",
            ErrorClass::DependencyUnmet => "dependency-unmet",
            ErrorClass::QuorumUnmet => "quorum-unmet",
            ErrorClass::ContextExpired => "context-expired",
            ErrorClass::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while invoking or resolving a single stage.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum StageError {
    /// Timeout, 5xx or 429. Eligible for retry.
    #[error("transient failure: {reason}")]
    Transient { reason: String },

    /// A transient failure that kept recurring until the retry budget ran out.
    #[error("transient failure persisted after {attempts} attempts: {last}")]
    TransientExhausted { attempts: u32, last: String },

    /// Validation failure or a 4xx other than 429. Never retried.
    #[error("permanent failure{}: {message}", code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Permanent {
        code: Option<String>,
        message: String,
    },

    #[error("dependency {dependency} did not succeed")]
    DependencyUnmet { dependency: StageName },

    #[error("phase {phase} quorum unmet: {succeeded} of {required} required successes")]
    QuorumUnmet {
        phase: PhaseName,
        succeeded: usize,
        required: usize,
    },

    #[error("shared context for run {run_id} expired")]
    ContextExpired { run_id: RunId },

    #[error("credential unavailable: {0}")]
    Credential(String),

    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    /// A retryable failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// A non-retryable failure carrying the endpoint's error code, if any.
    pub fn permanent(code: Option<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            code,
            message: message.into(),
        }
    }

    /// Classification used in attempt records and report reason codes.
    pub fn class(&self) -> ErrorClass {
        match self {
            StageError::Transient { .. } => ErrorClass::Transient,
            StageError::TransientExhausted { .. } => ErrorClass::TransientExhausted,
            StageError::Permanent { .. } | StageError::Credential(_) => ErrorClass::Permanent,
            StageError::DependencyUnmet { .. } => ErrorClass::DependencyUnmet,
            StageError::QuorumUnmet { .. } => ErrorClass::QuorumUnmet,
            StageError::ContextExpired { .. } => ErrorClass::ContextExpired,
            StageError::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Only transient failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transient { .. })
    }
}

/// Errors raised by run bookkeeping.
#[derive(Debug, Error, PartialEq)]
pub enum RunError {
    #[error("run {run_id}: illegal status transition {from:?} -> {to:?}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("run {0} already exists")]
    DuplicateRun(RunId),

    #[error("run {0} not found")]
    UnknownRun(RunId),
}

/// Errors raised while assembling a pipeline graph.
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("stage {0} declared more than once")]
    DuplicateStage(StageName),

    #[error("stage {stage} depends on undeclared stage {dependency}")]
    UnknownDependency {
        stage: StageName,
        dependency: StageName,
    },

    #[error("stage {stage} references undeclared phase {phase}")]
    UnknownPhase { stage: StageName, phase: PhaseName },

    #[error("phase {phase} lists undeclared member {member}")]
    UnknownPhaseMember { phase: PhaseName, member: StageName },

    #[error("phase {0} declared more than once")]
    DuplicatePhase(PhaseName),

    #[error("phase {phase} requires {min_successes} successes but has {members} members")]
    InvalidQuorum {
        phase: PhaseName,
        min_successes: usize,
        members: usize,
    },

    #[error("stage {0} depends on itself")]
    SelfDependency(StageName),

    #[error("dependency cycle through {0:?}")]
    Cycle(Vec<StageName>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(StageError::transient("503").class(), ErrorClass::Transient);
        assert_eq!(
            StageError::permanent(None, "bad ticker").class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            StageError::Credential("vault sealed".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            StageError::TransientExhausted {
                attempts: 3,
                last: "timeout".into()
            }
            .class()
            .as_str(),
            "transient-exhausted"
        );
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(StageError::transient("429").is_retryable());
        assert!(!StageError::permanent(Some("E400".into()), "nope").is_retryable());
        assert!(!StageError::Cancelled.is_retryable());
    }

    #[test]
    fn test_permanent_display_includes_code() {
        let err = StageError::permanent(Some("INVALID_TICKER".into()), "unknown symbol");
        assert_eq!(
            err.to_string(),
            "permanent failure [INVALID_TICKER]: unknown symbol"
        );
        let err = StageError::permanent(None, "unknown symbol");
        assert_eq!(err.to_string(), "permanent failure: unknown symbol");
    }

    #[test]
    fn test_error_class_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorClass::TransientExhausted).unwrap();
        assert_eq!(json, "\"transient-exhausted\"");
    }
}
