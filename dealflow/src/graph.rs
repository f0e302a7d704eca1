//! Declarative pipeline graph.
//!
//! A [`PipelineGraph`] is a validated DAG of [`StageSpec`]s plus the
//! [`PhaseSpec`]s grouping sibling stages under a quorum rule. The graph
//! decides *when* a stage may run and *whether* it should be skipped; the
//! orchestrator only executes what the graph reports as ready.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;
use crate::retry::RetryPolicy;
use crate::stage::{Criticality, PhaseName, SkipReason, StageName, StageResult, StageStatus};

/// Stage and phase names of the standard analysis pipeline.
pub mod names {
    /// Stage names of the standard pipeline.
    pub const INGEST_TARGET: &str = "ingest:target";
    pub const INGEST_COUNTERPARTY: &str = "ingest:counterparty";
    pub const NORMALIZE_TARGET: &str = "normalize:target";
    pub const CLASSIFY_TARGET: &str = "classify:target";
    pub const CLASSIFY_COUNTERPARTY: &str = "classify:counterparty";
    pub const IDENTIFY_PEERS: &str = "identify_peers";
    pub const MODEL_TARGET: &str = "model:target";
    pub const VALUATION_DCF: &str = "valuation:dcf";
    pub const VALUATION_LBO: &str = "valuation:lbo";
    pub const VALUATION_CCA: &str = "valuation:cca";
    pub const DUE_DILIGENCE: &str = "due_diligence";
    pub const FINAL_REPORT: &str = "final_report";

    pub const VALUATION_PHASE: &str = "valuation";

    /// Endpoint backed by the rate-governed upstream data API.
    pub const MARKET_DATA_ENDPOINT: &str = "market-data";
}

/// Predicate over a dependency's payload deciding whether a gated dependent
/// should run at all.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum PayloadGate {
    /// `field` exists and is a non-empty array, object or string.
    NonEmpty { field: String },
}

impl PayloadGate {
    /// Gate on `field` being present and non-empty.
    pub fn non_empty(field: impl Into<String>) -> Self {
        Self::NonEmpty {
            field: field.into(),
        }
    }

    /// Whether `payload` passes the gate. A missing payload never does.
    pub fn passes(&self, payload: Option<&Value>) -> bool {
        match self {
            PayloadGate::NonEmpty { field } => match payload.and_then(|p| p.get(field)) {
                Some(Value::Array(items)) => !items.is_empty(),
                Some(Value::Object(map)) => !map.is_empty(),
                Some(Value::String(s)) => !s.is_empty(),
                _ => false,
            },
        }
    }
}

/// How a stage depends on one upstream stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeKind {
    /// The dependent is skipped unless the dependency succeeded.
    Requires,
    /// The dependent runs whether or not the dependency succeeded.
    Tolerates,
    /// The dependent runs only if the dependency succeeded with a payload
    /// passing the gate; otherwise it is skipped by design.
    Gate(PayloadGate),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub stage: StageName,
    pub kind: EdgeKind,
}

/// Remote collaborator a stage is invoked against.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    /// Calls must go through the shared rate limiter.
    pub rate_governed: bool,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rate_governed: false,
        }
    }

    pub fn rate_governed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rate_governed: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissingContext {
    /// Create a fresh context and continue.
    #[default]
    Rebuild,
    /// Fail the stage with `ContextExpired`.
    Fail,
}

/// Whether a stage receives the run's shared context handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ContextPolicy {
    #[default]
    None,
    Use { on_missing: OnMissingContext },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: StageName,
    pub criticality: Criticality,
    pub endpoint: Endpoint,
    pub dependencies: Vec<Dependency>,
    /// Phases whose quorum must be met before this stage runs. Every member
    /// of such a phase is an implicit dependency.
    pub quorum: Vec<PhaseName>,
    pub context: ContextPolicy,
    /// Per-attempt timeout overriding the pipeline default.
    pub timeout: Option<Duration>,
    /// Retry policy overriding the pipeline default.
    pub retry: Option<RetryPolicy>,
}

impl StageSpec {
    /// Declare a stage with no dependencies, no quorum and no context.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique stage name within the graph.
    /// * `criticality` - What a terminal failure of this stage does to the run.
    /// * `endpoint` - Remote collaborator the stage invokes.
    pub fn new(name: impl Into<StageName>, criticality: Criticality, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            criticality,
            endpoint,
            dependencies: Vec::new(),
            quorum: Vec::new(),
            context: ContextPolicy::None,
            timeout: None,
            retry: None,
        }
    }

    /// Skip this stage unless `stage` succeeds.
    pub fn requires(self, stage: impl Into<StageName>) -> Self {
        self.depends_on(stage, EdgeKind::Requires)
    }

    /// Run this stage once `stage` is terminal, whatever its outcome.
    pub fn tolerates(self, stage: impl Into<StageName>) -> Self {
        self.depends_on(stage, EdgeKind::Tolerates)
    }

    /// Run this stage only if `stage` succeeds with a payload passing `gate`.
    pub fn gated_on(self, stage: impl Into<StageName>, gate: PayloadGate) -> Self {
        self.depends_on(stage, EdgeKind::Gate(gate))
    }

    pub fn depends_on(mut self, stage: impl Into<StageName>, kind: EdgeKind) -> Self {
        self.dependencies.push(Dependency {
            stage: stage.into(),
            kind,
        });
        self
    }

    /// Wait on the quorum of phase `phase`.
    pub fn with_quorum(mut self, phase: impl Into<PhaseName>) -> Self {
        self.quorum.push(phase.into());
        self
    }

    pub fn with_context(mut self, policy: ContextPolicy) -> Self {
        self.context = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Group of sibling stages of which at least `min_successes` must succeed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: PhaseName,
    pub members: Vec<StageName>,
    pub min_successes: usize,
    /// A critical phase whose quorum is unmet fails the run.
    pub criticality: Criticality,
}

impl PhaseSpec {
    /// Declare a critical phase over `members` needing `min_successes` of them.
    pub fn new<I, S>(name: impl Into<PhaseName>, members: I, min_successes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StageName>,
    {
        Self {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
            min_successes,
            criticality: Criticality::Critical,
        }
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    /// Count member successes among `results`.
    pub fn tally(&self, results: &BTreeMap<StageName, StageResult>) -> PhaseTally {
        let succeeded = self
            .members
            .iter()
            .filter(|m| results.get(*m).is_some_and(StageResult::is_success))
            .count();
        PhaseTally {
            succeeded,
            required: self.min_successes,
        }
    }
}

/// Member successes of a phase against its quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTally {
    pub succeeded: usize,
    pub required: usize,
}

impl PhaseTally {
    pub fn satisfied(&self) -> bool {
        self.succeeded >= self.required
    }
}

/// Scheduling decision for one stage given the results recorded so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Some upstream stage has not reached a terminal status.
    Waiting,
    Ready,
    Skip(SkipReason),
}

/// Validated pipeline DAG.
#[derive(Clone, Debug)]
pub struct PipelineGraph {
    stages: BTreeMap<StageName, StageSpec>,
    phases: BTreeMap<PhaseName, PhaseSpec>,
    order: Vec<StageName>,
}

impl PipelineGraph {
    /// Start an empty builder.
    pub fn builder() -> PipelineGraphBuilder {
        PipelineGraphBuilder::new()
    }

    /// The standard two-subject analysis pipeline.
    pub fn standard() -> Result<Self, GraphError> {
        use self::names::*;

        let data = || Endpoint::rate_governed(MARKET_DATA_ENDPOINT);
        let shared = ContextPolicy::Use {
            on_missing: OnMissingContext::Rebuild,
        };

        PipelineGraphBuilder::new()
            .stage(StageSpec::new(INGEST_TARGET, Criticality::Critical, data()))
            .stage(StageSpec::new(INGEST_COUNTERPARTY, Criticality::Critical, data()))
            .stage(
                StageSpec::new(NORMALIZE_TARGET, Criticality::Critical, Endpoint::new("normalize"))
                    .requires(INGEST_TARGET)
                    .requires(INGEST_COUNTERPARTY),
            )
            .stage(
                StageSpec::new(CLASSIFY_TARGET, Criticality::Degradable, Endpoint::new("classify"))
                    .requires(NORMALIZE_TARGET),
            )
            .stage(
                StageSpec::new(
                    CLASSIFY_COUNTERPARTY,
                    Criticality::Degradable,
                    Endpoint::new("classify"),
                )
                .requires(NORMALIZE_TARGET),
            )
            .stage(
                StageSpec::new(IDENTIFY_PEERS, Criticality::Degradable, data())
                    .requires(CLASSIFY_TARGET)
                    .tolerates(CLASSIFY_COUNTERPARTY),
            )
            .stage(
                StageSpec::new(MODEL_TARGET, Criticality::Critical, Endpoint::new("model"))
                    .requires(NORMALIZE_TARGET)
                    .with_context(shared),
            )
            .stage(
                StageSpec::new(VALUATION_DCF, Criticality::Degradable, Endpoint::new("valuation"))
                    .requires(MODEL_TARGET)
                    .with_context(shared),
            )
            .stage(
                StageSpec::new(VALUATION_LBO, Criticality::Degradable, Endpoint::new("valuation"))
                    .requires(MODEL_TARGET)
                    .with_context(shared),
            )
            .stage(
                StageSpec::new(VALUATION_CCA, Criticality::Degradable, data())
                    .requires(MODEL_TARGET)
                    .gated_on(IDENTIFY_PEERS, PayloadGate::non_empty("candidates"))
                    .with_context(shared),
            )
            .phase(PhaseSpec::new(
                VALUATION_PHASE,
                [VALUATION_DCF, VALUATION_CCA, VALUATION_LBO],
                1,
            ))
            .stage(
                StageSpec::new(DUE_DILIGENCE, Criticality::Degradable, Endpoint::new("diligence"))
                    .requires(MODEL_TARGET)
                    .with_quorum(VALUATION_PHASE)
                    .with_context(shared),
            )
            .stage(
                StageSpec::new(FINAL_REPORT, Criticality::Critical, Endpoint::new("report"))
                    .requires(MODEL_TARGET)
                    .tolerates(DUE_DILIGENCE)
                    .with_quorum(VALUATION_PHASE),
            )
            .build()
    }

    /// Look up a stage by name.
    ///
    /// Returns `None` for names the graph does not declare.
    pub fn stage(&self, name: &StageName) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Look up a phase by name.
    pub fn phase(&self, name: &PhaseName) -> Option<&PhaseSpec> {
        self.phases.get(name)
    }

    /// All declared phases, ordered by name.
    pub fn phases(&self) -> impl Iterator<Item = &PhaseSpec> {
        self.phases.values()
    }

    /// Stages in a deterministic topological order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.order.iter().filter_map(|name| self.stages.get(name))
    }

    /// Stage names in the order [`PipelineGraph::stages`] yields them.
    pub fn topological_order(&self) -> &[StageName] {
        &self.order
    }

    /// Number of declared stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Every stage that must be terminal before `name` may start: explicit
    /// dependencies plus the members of each quorum phase.
    pub fn upstream(&self, name: &StageName) -> BTreeSet<StageName> {
        let Some(spec) = self.stages.get(name) else {
            return BTreeSet::new();
        };
        let mut upstream: BTreeSet<StageName> =
            spec.dependencies.iter().map(|d| d.stage.clone()).collect();
        for phase in &spec.quorum {
            if let Some(phase) = self.phases.get(phase) {
                upstream.extend(phase.members.iter().cloned());
            }
        }
        upstream.remove(name);
        upstream
    }

    /// Stages listing `name` upstream.
    pub fn dependents(&self, name: &StageName) -> Vec<StageName> {
        self.order
            .iter()
            .filter(|candidate| self.upstream(candidate).contains(name))
            .cloned()
            .collect()
    }

    /// Decide what to do with `name` given the terminal results so far.
    ///
    /// When several edges block a stage, a failure-induced reason wins over a
    /// by-design one so the report reflects the real cause.
    pub fn readiness(
        &self,
        name: &StageName,
        results: &BTreeMap<StageName, StageResult>,
    ) -> Readiness {
        let Some(spec) = self.stages.get(name) else {
            return Readiness::Waiting;
        };

        let all_terminal = self
            .upstream(name)
            .iter()
            .all(|up| results.get(up).is_some_and(|r| r.status.is_terminal()));
        if !all_terminal {
            return Readiness::Waiting;
        }

        let mut by_design: Option<SkipReason> = None;
        let mut by_failure: Option<SkipReason> = None;
        let mut note = |reason: SkipReason| {
            let slot = if reason.is_by_design() {
                &mut by_design
            } else {
                &mut by_failure
            };
            if slot.is_none() {
                *slot = Some(reason);
            }
        };

        for dependency in &spec.dependencies {
            let Some(result) = results.get(&dependency.stage) else {
                continue;
            };
            match &dependency.kind {
                EdgeKind::Tolerates => {}
                EdgeKind::Requires => {
                    if result.is_success() || self.is_absent_optional(result) {
                        continue;
                    }
                    note(SkipReason::DependencyUnmet {
                        dependency: dependency.stage.clone(),
                        by_design: result.is_skipped_by_design(),
                    });
                }
                EdgeKind::Gate(gate) => {
                    if result.is_success() && gate.passes(result.payload.as_ref()) {
                        continue;
                    }
                    note(SkipReason::GateClosed {
                        dependency: dependency.stage.clone(),
                    });
                }
            }
        }

        for phase in &spec.quorum {
            let Some(phase) = self.phases.get(phase) else {
                continue;
            };
            let tally = phase.tally(results);
            if !tally.satisfied() {
                note(SkipReason::QuorumUnmet {
                    phase: phase.name.clone(),
                    succeeded: tally.succeeded,
                    required: tally.required,
                });
            }
        }

        match by_failure.or(by_design) {
            Some(reason) => Readiness::Skip(reason),
            None => Readiness::Ready,
        }
    }

    /// Whether a skip of `name` for `reason` must fail the whole run.
    pub fn skip_fails_run(&self, name: &StageName, reason: &SkipReason) -> bool {
        if let SkipReason::QuorumUnmet { phase, .. } = reason {
            if self
                .phases
                .get(phase)
                .is_some_and(|p| p.criticality == Criticality::Critical)
            {
                return true;
            }
        }
        !reason.is_by_design()
            && self
                .stages
                .get(name)
                .is_some_and(|s| s.criticality == Criticality::Critical)
    }

    // a failed OPTIONAL stage counts as "no output", never as unmet
    fn is_absent_optional(&self, result: &StageResult) -> bool {
        result.status == StageStatus::Failed
            && self
                .stages
                .get(&result.stage)
                .is_some_and(|s| s.criticality == Criticality::Optional)
    }
}

/// Builder validating a [`PipelineGraph`] at `build()`.
#[derive(Debug, Default)]
pub struct PipelineGraphBuilder {
    stages: Vec<StageSpec>,
    phases: Vec<PhaseSpec>,
}

impl PipelineGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage. Duplicates are reported by [`build`](Self::build).
    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    pub fn phase(mut self, spec: PhaseSpec) -> Self {
        self.phases.push(spec);
        self
    }

    /// Validate and freeze the graph.
    ///
    /// # Errors
    ///
    /// Fails on duplicate stage or phase names, references to undeclared
    /// stages or phases, self-dependencies, unreachable quorums and cycles.
    pub fn build(self) -> Result<PipelineGraph, GraphError> {
        let mut stages = BTreeMap::new();
        for spec in self.stages {
            if stages.contains_key(&spec.name) {
                return Err(GraphError::DuplicateStage(spec.name));
            }
            stages.insert(spec.name.clone(), spec);
        }

        let mut phases = BTreeMap::new();
        for phase in self.phases {
            if phases.contains_key(&phase.name) {
                return Err(GraphError::DuplicatePhase(phase.name));
            }
            for member in &phase.members {
                if !stages.contains_key(member) {
                    return Err(GraphError::UnknownPhaseMember {
                        phase: phase.name.clone(),
                        member: member.clone(),
                    });
                }
            }
            if phase.min_successes > phase.members.len() {
                return Err(GraphError::InvalidQuorum {
                    phase: phase.name.clone(),
                    min_successes: phase.min_successes,
                    members: phase.members.len(),
                });
            }
            phases.insert(phase.name.clone(), phase);
        }

        for spec in stages.values() {
            for dependency in &spec.dependencies {
                if dependency.stage == spec.name {
                    return Err(GraphError::SelfDependency(spec.name.clone()));
                }
                if !stages.contains_key(&dependency.stage) {
                    return Err(GraphError::UnknownDependency {
                        stage: spec.name.clone(),
                        dependency: dependency.stage.clone(),
                    });
                }
            }
            for phase in &spec.quorum {
                match phases.get(phase) {
                    None => {
                        return Err(GraphError::UnknownPhase {
                            stage: spec.name.clone(),
                            phase: phase.clone(),
                        })
                    }
                    Some(p) if p.members.contains(&spec.name) => {
                        return Err(GraphError::SelfDependency(spec.name.clone()))
                    }
                    Some(_) => {}
                }
            }
        }

        let mut graph = PipelineGraph {
            stages,
            phases,
            order: Vec::new(),
        };
        graph.order = topological_sort(&graph)?;
        Ok(graph)
    }
}

// Kahn's algorithm; ties broken by name so the order is stable.
fn topological_sort(graph: &PipelineGraph) -> Result<Vec<StageName>, GraphError> {
    let upstream: BTreeMap<&StageName, BTreeSet<StageName>> = graph
        .stages
        .keys()
        .map(|name| (name, graph.upstream(name)))
        .collect();

    let mut placed: HashSet<StageName> = HashSet::new();
    let mut order = Vec::with_capacity(graph.stages.len());
    let mut ready: BTreeSet<StageName> = upstream
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(name, _)| (*name).clone())
        .collect();

    while let Some(next) = ready.pop_first() {
        placed.insert(next.clone());
        order.push(next);
        for (name, deps) in &upstream {
            if !placed.contains(*name)
                && !ready.contains(*name)
                && deps.iter().all(|d| placed.contains(d))
            {
                ready.insert((*name).clone());
            }
        }
    }

    if order.len() != graph.stages.len() {
        let stuck = graph
            .stages
            .keys()
            .filter(|name| !placed.contains(*name))
            .cloned()
            .collect();
        return Err(GraphError::Cycle(stuck));
    }
    Ok(order)
}
