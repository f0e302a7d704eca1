use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::PipelineGraph;
use crate::run::{AnalysisRun, RunId, RunStatus, SubjectIds};
use crate::stage::{Criticality, PhaseName, StageName, StageResult, StageStatus};

/// Reason code for a declared stage that was never scheduled.
pub const NOT_SCHEDULED: &str = "not-scheduled";

/// Whether a report section carries data, and why not.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Present,
    AbsentByDesign,
    AbsentDueToFailure,
}

/// One report section per declared stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub stage: StageName,
    /// `None` if the stage was never scheduled.
    pub status: Option<StageStatus>,
    pub availability: Availability,
    pub reason: Option<String>,
    pub payload: Option<Value>,
}

/// Quorum outcome of one phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: PhaseName,
    pub succeeded: usize,
    pub required: usize,
    pub satisfied: bool,
}

/// Report assembled from a finished run.
///
/// Contains one section per declared stage, so every absence is explicit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub subjects: SubjectIds,
    pub sections: BTreeMap<StageName, Section>,
    pub phases: BTreeMap<PhaseName, PhaseSummary>,
    pub failure: Option<String>,
}

impl FinalReport {
    /// Section for `stage`, if the graph declares it.
    ///
    /// # Arguments
    ///
    /// * `stage` - Stage name, e.g. [`VALUATION_DCF`](crate::names::VALUATION_DCF).
    pub fn section(&self, stage: &str) -> Option<&Section> {
        self.sections.get(&StageName::from(stage))
    }

    /// Summary for phase `phase`.
    pub fn phase(&self, phase: &str) -> Option<&PhaseSummary> {
        self.phases.get(&PhaseName::from(phase))
    }

    /// Sections whose stage succeeded with a payload.
    ///
    /// Absent sections, by design or due to failure, are filtered out.
    pub fn present(&self) -> impl Iterator<Item = &Section> {
        self.sections
            .values()
            .filter(|s| s.availability == Availability::Present)
    }
}

/// Folds terminal stage results into a run status and a [`FinalReport`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Terminal status for a run whose stage map is `stages`.
    pub fn status(
        &self,
        graph: &PipelineGraph,
        stages: &BTreeMap<StageName, StageResult>,
        cancelled: bool,
    ) -> RunStatus {
        if cancelled {
            return RunStatus::Cancelled;
        }

        let mut degraded = false;
        for spec in graph.stages() {
            let failed = stages.get(&spec.name).map_or(true, StageResult::is_failure);
            if !failed {
                continue;
            }
            if spec.criticality == Criticality::Critical {
                return RunStatus::Failed;
            }
            degraded = true;
        }

        for phase in graph.phases() {
            if phase.tally(stages).satisfied() {
                continue;
            }
            if phase.criticality == Criticality::Critical {
                return RunStatus::Failed;
            }
            degraded = true;
        }

        if degraded {
            RunStatus::PartiallySucceeded
        } else {
            RunStatus::Succeeded
        }
    }

    /// Build the report for `run`, recomputing the run status from its
    /// stage results.
    ///
    /// # Arguments
    ///
    /// * `graph` - Declares the sections and phases to report.
    /// * `run` - Terminal stage results recorded so far.
    /// * `cancelled` - Forces CANCELLED and reports unscheduled stages as absent
    ///   due to failure.
    pub fn aggregate(&self, graph: &PipelineGraph, run: &AnalysisRun, cancelled: bool) -> FinalReport {
        let sections = graph
            .stages()
            .map(|spec| (spec.name.clone(), section(&spec.name, run.stages.get(&spec.name))))
            .collect();

        let phases = graph
            .phases()
            .map(|phase| {
                let tally = phase.tally(&run.stages);
                let summary = PhaseSummary {
                    phase: phase.name.clone(),
                    succeeded: tally.succeeded,
                    required: tally.required,
                    satisfied: tally.satisfied(),
                };
                (phase.name.clone(), summary)
            })
            .collect();

        FinalReport {
            run_id: run.run_id,
            status: self.status(graph, &run.stages, cancelled),
            subjects: run.subjects.clone(),
            sections,
            phases,
            failure: run.failure.clone(),
        }
    }
}

fn section(stage: &StageName, result: Option<&StageResult>) -> Section {
    let Some(result) = result else {
        return Section {
            stage: stage.clone(),
            status: None,
            availability: Availability::AbsentDueToFailure,
            reason: Some(NOT_SCHEDULED.to_string()),
            payload: None,
        };
    };

    let (availability, reason) = if result.is_success() {
        (Availability::Present, None)
    } else if result.is_skipped_by_design() {
        (
            Availability::AbsentByDesign,
            result.skip.as_ref().map(|s| s.reason_code()),
        )
    } else {
        let reason = match (&result.skip, &result.error) {
            (Some(skip), _) => skip.reason_code(),
            (None, Some(error)) => format!("stage-failed:{}", error.class()),
            (None, None) => format!("stage-{}", result.status.as_str()),
        };
        (Availability::AbsentDueToFailure, Some(reason))
    };

    Section {
        stage: stage.clone(),
        status: Some(result.status),
        availability,
        reason,
        payload: result.payload.clone(),
    }
}
