use dealflow::names::*;
use dealflow::*;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{RecordingSink, ScriptedTransport};

/// Subject pair used across the tests.
pub fn subjects() -> SubjectIds {
    SubjectIds::new("ACME", "GLOBEX")
}

/// Payload an unscripted stage succeeds with.
pub fn default_payload(stage: &str) -> Value {
    match stage {
        IDENTIFY_PEERS => json!({"candidates": ["INITECH", "HOOLI"]}),
        _ => json!({"stage": stage}),
    }
}

pub fn no_peers() -> Value {
    json!({"candidates": []})
}

/// A 200 reply carrying an error envelope.
pub fn error_envelope(code: &str, message: &str) -> TransportResponse {
    TransportResponse::new(
        200,
        json!({"status": "error", "error_code": code, "message": message}),
    )
}

pub fn http_status(status: u16) -> TransportResponse {
    TransportResponse::new(status, json!({"message": format!("HTTP {status}")}))
}

/// Config with short delays so tests run quickly under paused time.
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry = RetryPolicy::new(3, 10, 100);
    config.rate_limit = RateLimitConfig::new(100, std::time::Duration::from_secs(1));
    config.stage_timeout_ms = 1_000;
    config.orchestrator.cancel_grace_ms = 500;
    config
}

/// Orchestrator over the standard graph wired to the given test doubles.
pub fn orchestrator(
    transport: &ScriptedTransport,
    sink: &RecordingSink,
    config: PipelineConfig,
) -> anyhow::Result<PipelineOrchestrator> {
    PipelineOrchestratorBuilder::new(config)
        .with_transport(Arc::new(transport.clone()))
        .with_sink(Arc::new(sink.clone()))
        .build()
}
