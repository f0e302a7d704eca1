use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context as _;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;

use crate::aggregate::{FinalReport, ResultAggregator};
use crate::client::{Invocation, StageCall, StageClient, StageRequest};
use crate::config::PipelineConfig;
use crate::context::{ContextHandle, RunContext};
use crate::error::StageError;
use crate::events::{ObservabilitySink, RunEvent, RunEventPayload};
use crate::graph::{ContextPolicy, OnMissingContext, PipelineGraph, Readiness, StageSpec};
use crate::run::{AnalysisRun, RunId, RunStatus, SubjectIds};
use crate::stage::{Criticality, SkipReason, StageInvocation, StageName, StageResult};
use crate::store::RunStore;
use crate::telemetry::{self, StageTimingHandle};

use super::cancel::CancelToken;

type StageTaskOutput = (StageName, Result<Invocation, String>);

/// Drives one [`PipelineGraph`] per run: dispatches every eligible stage
/// concurrently, folds results in at a single fan-in point and applies the
/// criticality and quorum rules.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    graph: Arc<PipelineGraph>,
    client: Arc<StageClient>,
    context: RunContext,
    store: Arc<dyn RunStore>,
    sink: Arc<dyn ObservabilitySink>,
    config: PipelineConfig,
    aggregator: ResultAggregator,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("stages", &self.graph.len())
            .field("client", &self.client)
            .field("context", &self.context)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle to a run executing on its own task.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    cancel: CancelToken,
    task: JoinHandle<anyhow::Result<FinalReport>>,
}

impl RunHandle {
    /// Id the run was created under.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation. The run finishes as CANCELLED.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish and return its report.
    ///
    /// # Errors
    ///
    /// Fails if the run could not be created in the store or its task panicked.
    pub async fn join(self) -> anyhow::Result<FinalReport> {
        let run_id = self.run_id;
        self.task
            .await
            .map_err(|e| anyhow::anyhow!("run task {run_id} failed: {e}"))?
    }
}

enum Abort {
    /// A critical stage or quorum failed.
    Failed(String),
    /// External cancellation or the run deadline.
    Cancelled(&'static str),
}

struct Running {
    invocation: StageInvocation,
    timing: StageTimingHandle,
}

/// Mutable state of one run, owned by the coordinating task.
struct RunState {
    run: AnalysisRun,
    running: BTreeMap<StageName, Running>,
    context: Option<ContextHandle>,
    abort: Option<Abort>,
}

impl RunState {
    fn is_decided(&self, name: &StageName) -> bool {
        self.run.stages.contains_key(name) || self.running.contains_key(name)
    }
}

impl PipelineOrchestrator {
    pub(crate) fn new(
        graph: Arc<PipelineGraph>,
        client: Arc<StageClient>,
        context: RunContext,
        store: Arc<dyn RunStore>,
        sink: Arc<dyn ObservabilitySink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            graph,
            client,
            context,
            store,
            sink,
            config,
            aggregator: ResultAggregator::new(),
        }
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Store holding every run this orchestrator executed.
    pub fn store(&self) -> Arc<dyn RunStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline for `subjects` to completion on the current task.
    pub async fn run(&self, subjects: SubjectIds) -> anyhow::Result<FinalReport> {
        self.run_with_cancel(subjects, CancelToken::new()).await
    }

    /// Run to completion, cancelling when `cancel` fires.
    ///
    /// `cancel` may be shared between runs. A run that aborts on its own never
    /// cancels it.
    ///
    /// # Arguments
    ///
    /// * `subjects` - The two subjects to analyse.
    /// * `cancel` - Caller-owned token; the run finishes CANCELLED once it fires.
    pub async fn run_with_cancel(
        &self,
        subjects: SubjectIds,
        cancel: CancelToken,
    ) -> anyhow::Result<FinalReport> {
        let run_id = RunId::new();
        let span = telemetry::run_span(run_id.to_string(), &subjects.target, &subjects.counterparty);
        self.execute(run_id, subjects, cancel).instrument(span).await
    }

    /// Start a run on a new task and return a handle to it.
    pub fn spawn_run(&self, subjects: SubjectIds) -> RunHandle {
        let run_id = RunId::new();
        let cancel = CancelToken::new();
        let span = telemetry::run_span(run_id.to_string(), &subjects.target, &subjects.counterparty);
        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(
            async move { this.execute(run_id, subjects, token).await }.instrument(span),
        );
        RunHandle {
            run_id,
            cancel,
            task,
        }
    }

    async fn execute(
        &self,
        run_id: RunId,
        subjects: SubjectIds,
        cancel: CancelToken,
    ) -> anyhow::Result<FinalReport> {
        // aborting this run must never cancel the caller's token
        let cancel = cancel.child();
        let started = Instant::now();
        let mut state = RunState {
            run: AnalysisRun::with_id(run_id, subjects.clone()),
            running: BTreeMap::new(),
            context: None,
            abort: None,
        };
        self.store.create(state.run.clone()).await?;
        state.run.transition(RunStatus::Running)?;
        self.store.transition(run_id, RunStatus::Running, None).await?;
        self.publish(run_id, "run-started", RunEventPayload::RunStarted { subjects })
            .await;
        tracing::info!(run_id = %run_id, stages = self.graph.len(), "run started");

        let mut tasks: JoinSet<StageTaskOutput> = JoinSet::new();
        let deadline = self.config.orchestrator.run_timeout().map(|t| started + t);
        let deadline_sleep = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_sleep);

        loop {
            self.schedule(&mut state, &mut tasks, &cancel).await;
            if state.abort.is_some() || tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!(run_id = %run_id, "run cancellation observed");
                    state.abort = Some(Abort::Cancelled("run cancelled"));
                }
                _ = &mut deadline_sleep => {
                    tracing::warn!(run_id = %run_id, "run deadline exceeded");
                    state.abort = Some(Abort::Cancelled("run deadline exceeded"));
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((name, outcome))) => self.complete(&mut state, name, outcome).await,
                    Some(Err(e)) => {
                        tracing::error!(run_id = %run_id, error = %e, "stage task ended abnormally");
                        state.abort = Some(Abort::Failed(format!("stage task ended abnormally: {e}")));
                    }
                    None => {}
                },
            }
        }

        if state.abort.is_some() {
            cancel.cancel();
            self.wind_down(&mut state, &mut tasks).await;
        }

        self.finish(state, started).await
    }

    /// Decide every undecided stage whose upstream is terminal. One pass in
    /// topological order is enough: a skip recorded here is already visible
    /// to the stages after it.
    async fn schedule(
        &self,
        state: &mut RunState,
        tasks: &mut JoinSet<StageTaskOutput>,
        cancel: &CancelToken,
    ) {
        if cancel.is_cancelled() && state.abort.is_none() {
            state.abort = Some(Abort::Cancelled("run cancelled"));
        }

        let graph = Arc::clone(&self.graph);
        for spec in graph.stages() {
            if state.abort.is_some() {
                return;
            }
            if state.is_decided(&spec.name) {
                continue;
            }
            match graph.readiness(&spec.name, &state.run.stages) {
                Readiness::Waiting => {}
                Readiness::Skip(reason) => self.skip(state, spec, reason).await,
                Readiness::Ready => self.launch(state, tasks, spec, cancel).await,
            }
        }
    }

    async fn skip(
        &self,
        state: &mut RunState,
        spec: &StageSpec,
        reason: SkipReason,
    ) {
        let run_id = state.run.run_id;
        let fails_run = self.graph.skip_fails_run(&spec.name, &reason);
        let error = match &reason {
            SkipReason::DependencyUnmet { dependency, .. } => Some(StageError::DependencyUnmet {
                dependency: dependency.clone(),
            }),
            SkipReason::QuorumUnmet {
                phase,
                succeeded,
                required,
            } => Some(StageError::QuorumUnmet {
                phase: phase.clone(),
                succeeded: *succeeded,
                required: *required,
            }),
            SkipReason::GateClosed { .. } | SkipReason::Degraded { .. } => None,
        };

        if reason.is_by_design() {
            tracing::info!(run_id = %run_id, stage = %spec.name, reason = %reason.reason_code(), "stage skipped");
        } else {
            tracing::warn!(run_id = %run_id, stage = %spec.name, reason = %reason.reason_code(), "stage skipped after upstream failure");
        }
        if fails_run {
            let cause = error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| reason.reason_code());
            state.abort = Some(Abort::Failed(format!("{}: {cause}", spec.name)));
        }

        let result = StageResult::skipped(spec.name.clone(), reason, error);
        self.record(state, result).await;
    }

    async fn launch(
        &self,
        state: &mut RunState,
        tasks: &mut JoinSet<StageTaskOutput>,
        spec: &StageSpec,
        cancel: &CancelToken,
    ) {
        let run_id = state.run.run_id;
        let inputs: BTreeMap<StageName, Value> = self
            .graph
            .upstream(&spec.name)
            .into_iter()
            .filter_map(|up| {
                let result = state.run.stages.get(&up)?;
                let payload = result.payload.clone().filter(|_| result.is_success())?;
                Some((up, payload))
            })
            .collect();

        let mut invocation = StageInvocation::new(spec.name.clone());
        invocation.start();
        let timing = telemetry::record_stage_start(&spec.name);

        let context_handle = match self.resolve_context(state, spec, &inputs).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(run_id = %run_id, stage = %spec.name, error = %err, "stage context unavailable");
                let result = self.resolve_failure(state, spec, invocation, 0, err);
                telemetry::record_stage_finished(timing, run_id.to_string(), result.status.as_str());
                self.record(state, result).await;
                return;
            }
        };

        let call = StageCall {
            endpoint: spec.endpoint.clone(),
            request: StageRequest {
                run_id,
                stage: spec.name.clone(),
                subjects: state.run.subjects.clone(),
                context_handle,
                stage_inputs: inputs,
            },
            timeout: spec.timeout.unwrap_or_else(|| self.config.stage_timeout()),
            retry: spec.retry.clone().unwrap_or_else(|| self.config.retry.clone()),
            cancel: cancel.clone(),
        };

        tracing::debug!(run_id = %run_id, stage = %spec.name, criticality = spec.criticality.as_str(), "stage dispatched");
        state.running.insert(spec.name.clone(), Running { invocation, timing });
        self.publish(
            run_id,
            format!("stage-started-{}", spec.name),
            RunEventPayload::StageStarted {
                stage: spec.name.clone(),
            },
        )
        .await;

        let client = Arc::clone(&self.client);
        let name = spec.name.clone();
        let stage_task = telemetry::instrument_stage(run_id.to_string(), name.to_string(), async move {
            let outcome = AssertUnwindSafe(client.invoke(call))
                .catch_unwind()
                .await
                .map_err(|panic| panic_message(panic.as_ref()));
            (name, outcome)
        });
        tasks.spawn(stage_task);
    }

    /// Hand out the run's context, creating it on first need.
    async fn resolve_context(
        &self,
        state: &mut RunState,
        spec: &StageSpec,
        inputs: &BTreeMap<StageName, Value>,
    ) -> Result<Option<ContextHandle>, StageError> {
        let ContextPolicy::Use { on_missing } = spec.context else {
            return Ok(None);
        };
        let run_id = state.run.run_id;
        let store_err = |e: anyhow::Error| StageError::permanent(Some("CONTEXT_STORE".into()), e.to_string());

        if state.context.is_some() {
            if let Some(handle) = self.context.get(run_id).await.map_err(store_err)? {
                return Ok(Some(handle));
            }
            if on_missing == OnMissingContext::Fail {
                return Err(StageError::ContextExpired { run_id });
            }
            tracing::info!(run_id = %run_id, stage = %spec.name, "run context expired; rebuilding");
        }

        let seed = json!({
            "subjects": state.run.subjects,
            "stage_inputs": inputs,
        });
        let handle = self.context.create(run_id, seed).await.map_err(store_err)?;
        state.context = Some(handle.clone());
        state.run.context = Some(handle.clone());
        if let Err(e) = self.store.set_context(run_id, Some(handle.clone())).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to persist context handle");
        }
        Ok(Some(handle))
    }

    /// Fan-in for one finished stage task.
    async fn complete(
        &self,
        state: &mut RunState,
        name: StageName,
        outcome: Result<Invocation, String>,
    ) {
        let run_id = state.run.run_id;
        let Some(Running { invocation, timing }) = state.running.remove(&name) else {
            tracing::warn!(run_id = %run_id, stage = %name, "result for a stage that was not running");
            return;
        };
        let Some(spec) = self.graph.stage(&name) else {
            return;
        };

        let result = match outcome {
            Ok(Invocation {
                attempts,
                outcome: Ok(payload),
                ..
            }) => invocation.succeed(attempts, payload),
            Ok(Invocation {
                attempts,
                outcome: Err(StageError::Cancelled),
                ..
            }) => invocation.cancel(attempts),
            Ok(Invocation {
                attempts,
                outcome: Err(err),
                ..
            }) => self.resolve_failure(state, spec, invocation, attempts, err),
            Err(panic) => {
                tracing::error!(run_id = %run_id, stage = %name, panic = %panic, "stage task panicked");
                let err = StageError::permanent(Some("PANICKED".into()), panic);
                self.resolve_failure(state, spec, invocation, 0, err)
            }
        };

        telemetry::record_stage_finished(timing, run_id.to_string(), result.status.as_str());
        self.record(state, result).await;
    }

    /// Apply the stage's criticality to a failure.
    fn resolve_failure(
        &self,
        state: &mut RunState,
        spec: &StageSpec,
        invocation: StageInvocation,
        attempts: u32,
        err: StageError,
    ) -> StageResult {
        let run_id = state.run.run_id;
        match spec.criticality {
            Criticality::Critical => {
                tracing::error!(run_id = %run_id, stage = %spec.name, error = %err, class = %err.class(), "critical stage failed; aborting run");
                if state.abort.is_none() {
                    state.abort = Some(Abort::Failed(format!("{}: {err}", spec.name)));
                }
                invocation.fail(attempts, err)
            }
            Criticality::Degradable => {
                tracing::warn!(run_id = %run_id, stage = %spec.name, error = %err, class = %err.class(), "degradable stage failed; skipping");
                invocation.degrade(attempts, err)
            }
            Criticality::Optional => {
                tracing::warn!(run_id = %run_id, stage = %spec.name, error = %err, class = %err.class(), "optional stage failed");
                invocation.fail(attempts, err)
            }
        }
    }

    /// Let in-flight stages observe the cancelled token, then abort them.
    /// Nothing that finishes from here on is recorded as a success.
    async fn wind_down(
        &self,
        state: &mut RunState,
        tasks: &mut JoinSet<StageTaskOutput>,
    ) {
        let run_id = state.run.run_id;
        let grace = self.config.orchestrator.cancel_grace();
        let mut finished = Vec::new();

        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok((name, outcome)) = joined {
                    let attempts = outcome.as_ref().map(|inv| inv.attempts).unwrap_or(0);
                    finished.push((name, attempts));
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(run_id = %run_id, in_flight = tasks.len(), grace_ms = grace.as_millis() as u64, "cancel grace elapsed; aborting stage tasks");
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                if let Ok((name, outcome)) = joined {
                    let attempts = outcome.as_ref().map(|inv| inv.attempts).unwrap_or(0);
                    finished.push((name, attempts));
                }
            }
        }

        let mut attempts: BTreeMap<StageName, u32> = finished.into_iter().collect();
        let leftover = std::mem::take(&mut state.running);
        for (name, Running { invocation, timing }) in leftover {
            let result = invocation.cancel(attempts.remove(&name).unwrap_or(0));
            telemetry::record_stage_finished(timing, run_id.to_string(), result.status.as_str());
            self.record(state, result).await;
        }
    }

    async fn finish(&self, mut state: RunState, started: Instant) -> anyhow::Result<FinalReport> {
        let run_id = state.run.run_id;
        let (status, cancelled, failure) = match state.abort.take() {
            Some(Abort::Cancelled(reason)) => (RunStatus::Cancelled, true, Some(reason.to_string())),
            Some(Abort::Failed(cause)) => (RunStatus::Failed, false, Some(cause)),
            None => (
                self.aggregator.status(&self.graph, &state.run.stages, false),
                false,
                None,
            ),
        };

        if let Err(e) = state.run.transition(status) {
            tracing::warn!(run_id = %run_id, error = %e, "run already terminal");
        }
        state.run.failure = failure.clone();
        let persisted = self.store.transition(run_id, status, failure).await;
        if let Err(e) = &persisted {
            tracing::error!(run_id = %run_id, error = %e, status = status.as_str(), "failed to persist terminal run status");
        }

        if state.context.is_some() {
            match self.context.release(run_id).await {
                Ok(_) => tracing::debug!(run_id = %run_id, "run context released"),
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "failed to release run context"),
            }
        }

        self.publish(run_id, "run-finished", RunEventPayload::RunFinished { status })
            .await;
        telemetry::record_run_finished(run_id.to_string(), status.as_str(), started.elapsed());
        persisted.with_context(|| format!("run {run_id} finished {} but was not persisted", status.as_str()))?;

        let mut report = self.aggregator.aggregate(&self.graph, &state.run, cancelled);
        report.status = status;
        Ok(report)
    }

    /// Single writer for stage results. A store failure aborts the run but
    /// the result is still kept in memory for the final report.
    async fn record(&self, state: &mut RunState, result: StageResult) {
        let run_id = state.run.run_id;
        if let Err(e) = self.store.record_stage(run_id, result.clone()).await {
            tracing::error!(run_id = %run_id, stage = %result.stage, error = %e, "failed to persist stage result; aborting run");
            if state.abort.is_none() {
                state.abort = Some(Abort::Failed(format!("run store unavailable: {e}")));
            }
        }
        self.publish(
            run_id,
            format!("stage-finished-{}", result.stage),
            RunEventPayload::StageFinished {
                stage: result.stage.clone(),
                status: result.status,
                attempts: result.attempts,
            },
        )
        .await;
        state.run.stages.insert(result.stage.clone(), result);
    }

    async fn publish(&self, run_id: RunId, key: impl Into<String>, payload: RunEventPayload) {
        if let Err(e) = self.sink.publish(RunEvent::new(run_id, key, payload)).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to publish run event");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "stage task panicked".to_string()
    }
}
