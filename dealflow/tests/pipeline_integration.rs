//! End-to-end pipeline runs against scripted stage endpoints.
//!
//! Covers dependency ordering, criticality handling, the peer gate in front
//! of comparable-company valuation, quorum evaluation and determinism of the
//! final stage map.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dealflow::names::*;
use dealflow::*;
use dealflow_testkit::fixtures::{self, fast_config, subjects};
use dealflow_testkit::{RecordingSink, ScriptedTransport};
use serde_json::json;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(120);

fn setup() -> (ScriptedTransport, RecordingSink, PipelineOrchestrator) {
    let transport = ScriptedTransport::new();
    let sink = RecordingSink::new();
    let orchestrator = fixtures::orchestrator(&transport, &sink, fast_config()).unwrap();
    (transport, sink, orchestrator)
}

async fn run(orchestrator: &PipelineOrchestrator) -> FinalReport {
    timeout(TEST_TIMEOUT, orchestrator.run(subjects()))
        .await
        .expect("run should finish")
        .expect("run should not error")
}

async fn stored_run(orchestrator: &PipelineOrchestrator, run_id: RunId) -> AnalysisRun {
    orchestrator
        .store()
        .get(run_id)
        .await
        .unwrap()
        .expect("run should be stored")
}

fn status_of(run: &AnalysisRun, stage: &str) -> Option<StageStatus> {
    run.stage(&stage.into()).map(|r| r.status)
}

#[tokio::test(start_paused = true)]
async fn test_all_stages_succeed() {
    let (transport, sink, orchestrator) = setup();
    let report = run(&orchestrator).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.present().count(), orchestrator.graph().len());
    assert!(report.failure.is_none());

    let phase = report.phase(VALUATION_PHASE).unwrap();
    assert_eq!((phase.succeeded, phase.required), (3, 1));
    assert!(phase.satisfied);

    let stored = stored_run(&orchestrator, report.run_id).await;
    assert_eq!(stored.status, RunStatus::Succeeded);
    assert_eq!(stored.stages.len(), orchestrator.graph().len());
    assert_eq!(sink.run_finished(), Some(RunStatus::Succeeded));
    assert_eq!(transport.calls().len(), orchestrator.graph().len());
}

#[tokio::test(start_paused = true)]
async fn test_dependents_never_start_before_dependencies_finish() {
    let (transport, _sink, orchestrator) = setup();
    // uneven latencies so a scheduler ignoring edges would be caught
    transport
        .delay(INGEST_TARGET, Duration::from_millis(300))
        .delay(INGEST_COUNTERPARTY, Duration::from_millis(20))
        .delay(CLASSIFY_TARGET, Duration::from_millis(250))
        .delay(MODEL_TARGET, Duration::from_millis(40))
        .delay(VALUATION_LBO, Duration::from_millis(400))
        .delay(IDENTIFY_PEERS, Duration::from_millis(10));

    let report = run(&orchestrator).await;
    assert_eq!(report.status, RunStatus::Succeeded);

    let graph = orchestrator.graph();
    for spec in graph.stages() {
        for upstream in graph.upstream(&spec.name) {
            transport.assert_finished_before(upstream.as_str(), spec.name.as_str());
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_independent_stages_run_concurrently() {
    let (transport, _sink, orchestrator) = setup();
    for stage in [INGEST_TARGET, INGEST_COUNTERPARTY, VALUATION_DCF, VALUATION_LBO, VALUATION_CCA] {
        transport.delay(stage, Duration::from_millis(200));
    }
    run(&orchestrator).await;

    let started = |stage: &str| transport.calls_for(stage)[0].started;
    assert_eq!(started(INGEST_TARGET), started(INGEST_COUNTERPARTY));
    assert_eq!(started(VALUATION_DCF), started(VALUATION_LBO));
}

#[tokio::test(start_paused = true)]
async fn test_critical_failure_aborts_run() {
    let (transport, _sink, orchestrator) = setup();
    transport.fail_permanently(NORMALIZE_TARGET, "SCHEMA_MISMATCH");

    let report = run(&orchestrator).await;
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report
        .failure
        .as_deref()
        .is_some_and(|f| f.contains(NORMALIZE_TARGET) && f.contains("SCHEMA_MISMATCH")));

    let stored = stored_run(&orchestrator, report.run_id).await;
    let stages: Vec<(&str, StageStatus)> = stored
        .stages
        .iter()
        .map(|(name, r)| (name.as_str(), r.status))
        .collect();
    assert_eq!(
        stages,
        vec![
            (INGEST_COUNTERPARTY, StageStatus::Succeeded),
            (INGEST_TARGET, StageStatus::Succeeded),
            (NORMALIZE_TARGET, StageStatus::Failed),
        ]
    );

    for stage in [VALUATION_DCF, VALUATION_LBO, VALUATION_CCA, DUE_DILIGENCE, FINAL_REPORT] {
        assert!(!transport.was_called(stage), "{stage} should not be scheduled");
        let section = report.section(stage).unwrap();
        assert_eq!(section.availability, Availability::AbsentDueToFailure);
        assert_eq!(section.reason.as_deref(), Some(NOT_SCHEDULED));
    }
    assert_eq!(transport.call_count(NORMALIZE_TARGET), 1);
}

#[tokio::test(start_paused = true)]
async fn test_critical_failure_cancels_running_siblings() {
    let transport = ScriptedTransport::new();
    let sink = RecordingSink::new();
    let mut config = fast_config();
    config.stage_timeout_ms = 600_000;
    transport
        .fail_permanently(INGEST_TARGET, "UNKNOWN_TICKER")
        .delay(INGEST_COUNTERPARTY, Duration::from_secs(30));
    let orchestrator = fixtures::orchestrator(&transport, &sink, config).unwrap();

    let started = tokio::time::Instant::now();
    let report = run(&orchestrator).await;

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report
        .failure
        .as_deref()
        .is_some_and(|f| f.contains(INGEST_TARGET)));

    let stored = stored_run(&orchestrator, report.run_id).await;
    assert_eq!(status_of(&stored, INGEST_TARGET), Some(StageStatus::Failed));
    assert_eq!(
        status_of(&stored, INGEST_COUNTERPARTY),
        Some(StageStatus::Cancelled)
    );
    assert_eq!(stored.stages.len(), 2);
    assert!(transport.calls_for(INGEST_COUNTERPARTY)[0].finished.is_none());
    for stage in [NORMALIZE_TARGET, MODEL_TARGET, FINAL_REPORT] {
        assert!(!transport.was_called(stage), "{stage} should not be scheduled");
    }
}

#[tokio::test(start_paused = true)]
async fn test_degraded_peer_search_partially_succeeds() {
    let (transport, _sink, orchestrator) = setup();
    transport.fail_permanently(IDENTIFY_PEERS, "NO_SECTOR_MATCH");

    let report = run(&orchestrator).await;
    assert_eq!(report.status, RunStatus::PartiallySucceeded);

    let stored = stored_run(&orchestrator, report.run_id).await;
    assert_eq!(status_of(&stored, IDENTIFY_PEERS), Some(StageStatus::Skipped));
    assert!(stored.stage(&IDENTIFY_PEERS.into()).unwrap().degraded);
    assert_eq!(status_of(&stored, VALUATION_DCF), Some(StageStatus::Succeeded));
    assert_eq!(status_of(&stored, VALUATION_LBO), Some(StageStatus::Succeeded));
    assert_eq!(status_of(&stored, VALUATION_CCA), Some(StageStatus::Skipped));
    assert_eq!(status_of(&stored, FINAL_REPORT), Some(StageStatus::Succeeded));
    assert!(!transport.was_called(VALUATION_CCA));

    let cca = report.section(VALUATION_CCA).unwrap();
    assert_eq!(cca.availability, Availability::AbsentByDesign);
    assert_eq!(cca.reason.as_deref(), Some("gate-closed:identify_peers"));

    let peers = report.section(IDENTIFY_PEERS).unwrap();
    assert_eq!(peers.availability, Availability::AbsentDueToFailure);
    assert_eq!(peers.reason.as_deref(), Some("stage-failed:permanent"));

    let phase = report.phase(VALUATION_PHASE).unwrap();
    assert_eq!(phase.succeeded, 2);
    assert!(phase.satisfied);
}

#[tokio::test(start_paused = true)]
async fn test_empty_peer_set_skips_comparables_by_design() {
    let (transport, _sink, orchestrator) = setup();
    transport.ok(IDENTIFY_PEERS, fixtures::no_peers());

    let report = run(&orchestrator).await;
    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(!transport.was_called(VALUATION_CCA));
    assert_eq!(
        report.section(VALUATION_CCA).unwrap().availability,
        Availability::AbsentByDesign
    );
    assert_eq!(
        report.section(VALUATION_DCF).unwrap().availability,
        Availability::Present
    );
    assert_eq!(report.phase(VALUATION_PHASE).unwrap().succeeded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_empty_peers_with_failed_dcf_and_lbo_fails_quorum() {
    let (transport, _sink, orchestrator) = setup();
    transport
        .ok(IDENTIFY_PEERS, fixtures::no_peers())
        .fail_permanently(VALUATION_DCF, "MODEL_DIVERGED")
        .fail_permanently(VALUATION_LBO, "NO_DEBT_TERMS");

    let report = run(&orchestrator).await;
    assert_eq!(report.status, RunStatus::Failed);

    let phase = report.phase(VALUATION_PHASE).unwrap();
    assert_eq!(phase.succeeded, 0);
    assert!(!phase.satisfied);

    let stored = stored_run(&orchestrator, report.run_id).await;
    let diligence = stored.stage(&DUE_DILIGENCE.into()).unwrap();
    assert_eq!(diligence.status, StageStatus::Skipped);
    assert!(matches!(
        diligence.skip,
        Some(SkipReason::QuorumUnmet {
            succeeded: 0,
            required: 1,
            ..
        })
    ));
    assert!(!transport.was_called(FINAL_REPORT));
    assert!(!transport.was_called(DUE_DILIGENCE));
}

#[tokio::test(start_paused = true)]
async fn test_degradable_failure_propagates_to_required_dependents() {
    let (transport, _sink, orchestrator) = setup();
    transport.fail_permanently(CLASSIFY_TARGET, "UNKNOWN_INDUSTRY");

    let report = run(&orchestrator).await;
    assert_eq!(report.status, RunStatus::PartiallySucceeded);

    let stored = stored_run(&orchestrator, report.run_id).await;
    let peers = stored.stage(&IDENTIFY_PEERS.into()).unwrap();
    assert_eq!(peers.status, StageStatus::Skipped);
    assert_eq!(
        peers.skip,
        Some(SkipReason::DependencyUnmet {
            dependency: CLASSIFY_TARGET.into(),
            by_design: false,
        })
    );
    assert!(peers.is_failure());
    // the gate closes because the peer search never produced candidates
    assert_eq!(status_of(&stored, VALUATION_CCA), Some(StageStatus::Skipped));
    assert_eq!(status_of(&stored, FINAL_REPORT), Some(StageStatus::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_within_a_run() {
    let (transport, sink, orchestrator) = setup();
    transport
        .reply(INGEST_TARGET, Ok(fixtures::http_status(503)))
        .reply(INGEST_TARGET, Ok(fixtures::error_envelope("RATE_LIMITED", "slow down")));

    let report = run(&orchestrator).await;
    assert_eq!(report.status, RunStatus::Succeeded);

    let stored = stored_run(&orchestrator, report.run_id).await;
    assert_eq!(stored.stage(&INGEST_TARGET.into()).unwrap().attempts, 3);
    assert_eq!(transport.call_count(INGEST_TARGET), 3);

    let attempts = sink.attempts_for(INGEST_TARGET);
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[2].outcome, AttemptOutcome::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_transient_failure_on_critical_stage_fails_run() {
    let (transport, _sink, orchestrator) = setup();
    transport.always(MODEL_TARGET, Ok(fixtures::http_status(502)));

    let report = run(&orchestrator).await;
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(
        report.section(MODEL_TARGET).unwrap().reason.as_deref(),
        Some("stage-failed:transient-exhausted")
    );
    assert_eq!(transport.call_count(MODEL_TARGET), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stage_inputs_carry_upstream_payloads() {
    let (transport, _sink, orchestrator) = setup();
    transport.ok(NORMALIZE_TARGET, json!({"revenue": 120, "ebitda": 30}));

    run(&orchestrator).await;

    let call = &transport.calls_for(MODEL_TARGET)[0];
    assert_eq!(
        call.body["stage_inputs"][NORMALIZE_TARGET],
        json!({"revenue": 120, "ebitda": 30})
    );
    assert_eq!(call.body["subjects"]["target"], "ACME");
}

#[tokio::test(start_paused = true)]
async fn test_context_is_shared_and_released() {
    let transport = ScriptedTransport::new();
    let contexts = InMemoryContextStore::new();
    let orchestrator = PipelineOrchestratorBuilder::new(fast_config())
        .with_transport(Arc::new(transport.clone()))
        .with_context_store(Arc::new(contexts.clone()))
        .build()
        .unwrap();

    let report = run(&orchestrator).await;
    assert_eq!(report.status, RunStatus::Succeeded);

    let reference = |stage: &str| {
        transport.calls_for(stage)[0].body["context_handle"]["reference"]
            .as_str()
            .map(str::to_string)
    };
    let model_ref = reference(MODEL_TARGET).expect("model receives a context");
    assert_eq!(reference(VALUATION_DCF), Some(model_ref.clone()));
    assert_eq!(reference(DUE_DILIGENCE), Some(model_ref));
    assert!(transport.calls_for(INGEST_TARGET)[0].body["context_handle"].is_null());

    let stored = stored_run(&orchestrator, report.run_id).await;
    assert!(stored.context.is_some());
    assert!(contexts.is_empty().await, "context released at completion");
}

#[tokio::test(start_paused = true)]
async fn test_stage_map_is_independent_of_arrival_order() {
    let (fast, _, first) = setup();
    let (slow, _, second) = setup();
    fast.fail_permanently(VALUATION_LBO, "X");
    slow.fail_permanently(VALUATION_LBO, "X")
        .delay(VALUATION_DCF, Duration::from_millis(500))
        .delay(INGEST_TARGET, Duration::from_millis(50))
        .delay(CLASSIFY_COUNTERPARTY, Duration::from_millis(90));

    let a = run(&first).await;
    let b = run(&second).await;

    let summary = |report: &FinalReport| {
        report
            .sections
            .iter()
            .map(|(name, s)| (name.clone(), s.status, s.availability, s.reason.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(a.status, b.status);
    assert_eq!(summary(&a), summary(&b));
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events_are_published() {
    let (_transport, sink, orchestrator) = setup();
    run(&orchestrator).await;

    let events = sink.events();
    assert!(matches!(
        events.first().map(|e| &e.payload),
        Some(RunEventPayload::RunStarted { .. })
    ));
    assert!(matches!(
        events.last().map(|e| &e.payload),
        Some(RunEventPayload::RunFinished {
            status: RunStatus::Succeeded
        })
    ));
    assert_eq!(sink.finished_stages().len(), orchestrator.graph().len());
    assert_eq!(sink.attempts().len(), orchestrator.graph().len());
}

#[tokio::test(start_paused = true)]
async fn test_optional_stage_failure_does_not_abort() {
    let graph = PipelineGraph::builder()
        .stage(StageSpec::new(INGEST_TARGET, Criticality::Critical, Endpoint::new("data")))
        .stage(
            StageSpec::new("enrich:news", Criticality::Optional, Endpoint::new("news"))
                .requires(INGEST_TARGET),
        )
        .stage(
            StageSpec::new(FINAL_REPORT, Criticality::Critical, Endpoint::new("report"))
                .requires("enrich:news"),
        )
        .build()
        .unwrap();
    let transport = ScriptedTransport::new();
    transport.fail_permanently("enrich:news", "FEED_DOWN");
    let orchestrator = PipelineOrchestratorBuilder::new(fast_config())
        .with_graph(graph)
        .with_transport(Arc::new(transport.clone()))
        .build()
        .unwrap();

    let report = run(&orchestrator).await;
    assert_eq!(report.status, RunStatus::PartiallySucceeded);
    assert!(transport.was_called(FINAL_REPORT));
    assert!(transport.calls_for(FINAL_REPORT)[0].body["stage_inputs"]
        .get("enrich:news")
        .is_none());
    assert_eq!(
        report.section("enrich:news").unwrap().status,
        Some(StageStatus::Failed)
    );
}

/// Fails to persist the result of one stage.
#[derive(Clone, Debug, Default)]
struct FlakyStore {
    inner: InMemoryRunStore,
    fail_on: &'static str,
}

#[async_trait]
impl RunStore for FlakyStore {
    async fn create(&self, run: AnalysisRun) -> anyhow::Result<()> {
        self.inner.create(run).await
    }

    async fn get(&self, run_id: RunId) -> anyhow::Result<Option<AnalysisRun>> {
        self.inner.get(run_id).await
    }

    async fn record_stage(&self, run_id: RunId, result: StageResult) -> anyhow::Result<()> {
        if result.stage.as_str() == self.fail_on {
            anyhow::bail!("disk full");
        }
        self.inner.record_stage(run_id, result).await
    }

    async fn transition(
        &self,
        run_id: RunId,
        status: RunStatus,
        failure: Option<String>,
    ) -> anyhow::Result<()> {
        self.inner.transition(run_id, status, failure).await
    }

    async fn set_context(&self, run_id: RunId, handle: Option<ContextHandle>) -> anyhow::Result<()> {
        self.inner.set_context(run_id, handle).await
    }

    async fn run_ids(&self) -> anyhow::Result<Vec<RunId>> {
        self.inner.run_ids().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_still_finishes_run() {
    let transport = ScriptedTransport::new();
    let contexts = InMemoryContextStore::new();
    let store = FlakyStore {
        fail_on: MODEL_TARGET,
        ..FlakyStore::default()
    };
    let orchestrator = PipelineOrchestratorBuilder::new(fast_config())
        .with_transport(Arc::new(transport.clone()))
        .with_context_store(Arc::new(contexts.clone()))
        .with_store(Arc::new(store.clone()))
        .build()
        .unwrap();

    let report = run(&orchestrator).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report
        .failure
        .as_deref()
        .is_some_and(|f| f.contains("run store unavailable")));
    let stored = stored_run(&orchestrator, report.run_id).await;
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(contexts.is_empty().await, "context released despite the store failure");
    assert!(!transport.was_called(VALUATION_DCF));
    assert_eq!(
        report.section(MODEL_TARGET).unwrap().availability,
        Availability::Present
    );
}
