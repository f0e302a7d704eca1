//! Runs the standard pipeline against scripted in-memory endpoints.
//!
//! The peer search is scripted to fail so the run finishes
//! PARTIALLY_SUCCEEDED with the comparables section absent by design.
//!
//! ```text
//! RUST_LOG=dealflow=debug cargo run --example run_pipeline [config.json]
//! ```

use std::sync::Arc;
use std::time::Duration;

use dealflow::names::*;
use dealflow::*;
use dealflow_testkit::fixtures;
use dealflow_testkit::ScriptedTransport;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dealflow=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => fixtures::fast_config(),
    };

    let transport = ScriptedTransport::new();
    transport
        .delay(INGEST_TARGET, Duration::from_millis(120))
        .delay(INGEST_COUNTERPARTY, Duration::from_millis(80))
        .delay(MODEL_TARGET, Duration::from_millis(200))
        .reply(NORMALIZE_TARGET, Ok(fixtures::http_status(503)))
        .fail_permanently(IDENTIFY_PEERS, "NO_SECTOR_MATCH");

    let bus = Arc::new(InProcEventBus::new(config.event_capacity));
    let mut events = bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.payload {
                RunEventPayload::StageFinished {
                    stage,
                    status,
                    attempts,
                } => println!("  {stage:<24} {:<10} attempts={attempts}", status.as_str()),
                RunEventPayload::RunFinished { .. } => break,
                _ => {}
            }
        }
    });

    let orchestrator = PipelineOrchestratorBuilder::new(config)
        .with_transport(Arc::new(transport.clone()))
        .with_sink(bus)
        .build()?;

    println!("stages:");
    let report = orchestrator.run(SubjectIds::new("ACME", "GLOBEX")).await?;
    printer.await?;

    println!("\nrun {} finished {}", report.run_id, report.status.as_str());
    for section in report.sections.values() {
        println!(
            "  {:<24} {:?}{}",
            section.stage,
            section.availability,
            section
                .reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default()
        );
    }
    for phase in report.phases.values() {
        println!(
            "phase {}: {}/{} required, satisfied={}",
            phase.phase, phase.succeeded, phase.required, phase.satisfied
        );
    }
    println!("\n{}", serde_json::to_string_pretty(&report)?);
    println!("endpoint calls: {}", transport.calls().len());
    Ok(())
}
