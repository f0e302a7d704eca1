//! Dealflow - dependency-aware orchestration for multi-stage analysis pipelines.
//!
//! Given a target and a counterparty, dealflow drives a partially parallel
//! graph of remote computation stages (ingestion, normalization,
//! classification, modeling, valuation, diligence, reporting), each served
//! by an external collaborator over request/response calls.
//!
//! # Core Concepts
//!
//! - **Graph**: [`PipelineGraph`] declares stages, their dependency edges
//!   (`Requires`, `Tolerates`, payload `Gate`s), criticality and phase quorums.
//!
//! - **Client**: [`StageClient`] invokes one stage through a [`StageTransport`],
//!   going through the shared [`RateLimiter`] for rate-governed endpoints and
//!   retrying transient failures with exponential backoff.
//!
//! - **Context**: [`RunContext`] hands out a per-run [`ContextHandle`] with a
//!   fixed TTL so expensive shared state is built once per run.
//!
//! - **Runtime**: [`PipelineOrchestrator`] runs every eligible stage
//!   concurrently, folds results in at a single fan-in point and applies the
//!   criticality and quorum rules.
//!
//! - **Aggregation**: [`ResultAggregator`] derives the terminal [`RunStatus`]
//!   and a [`FinalReport`] that annotates every declared section.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dealflow::*;
//!
//! let orchestrator = PipelineOrchestratorBuilder::new(PipelineConfig::default())
//!     .with_transport(Arc::new(my_transport))
//!     .build()?;
//!
//! let report = orchestrator.run(SubjectIds::new("ACME", "GLOBEX")).await?;
//! println!("{} -> {:?}", report.run_id, report.status);
//! ```

/// Terminal run status and final report assembly.
pub mod aggregate;

/// Stage client, transport and credential traits.
///
/// The `client` module provides [`StageClient`] plus the collaborator traits
/// it is built on: [`StageTransport`] and [`CredentialProvider`].
pub mod client;

/// Pipeline configuration loaded from JSON.
pub mod config;

/// Per-run shared execution context.
pub mod context;

/// Error types and failure classification.
pub mod error;

/// Run and attempt events plus observability sinks.
///
/// The `events` module provides:
/// - [`RunEvent`] and [`RunEventPayload`] for lifecycle events
/// - [`AttemptRecord`] emitted once per network attempt
/// - [`ObservabilitySink`] trait with [`InProcEventBus`] and [`TracingSink`]
pub mod events;

/// Pipeline DAG declaration and validation.
pub mod graph;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled by the `metrics` feature.
pub mod metrics;

/// Sliding-window rate limiting for shared upstream APIs.
pub mod rate_limit;

/// Retry policy and backoff computation.
pub mod retry;

/// Analysis run identity and lifecycle.
pub mod run;

/// Orchestrator runtime.
///
/// The `runtime` module provides:
/// - [`PipelineOrchestrator`] - the DAG execution loop
/// - [`PipelineOrchestratorBuilder`] - wiring of collaborators
/// - [`RunHandle`] - handle to a spawned run
/// - [`CancelToken`] - cooperative cancellation
pub mod runtime;

/// Stage naming, status and results.
pub mod stage;

/// Run persistence.
pub mod store;

/// Tracing spans and telemetry helpers.
pub mod telemetry;

pub use aggregate::*;
pub use client::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use events::*;
pub use graph::*;
pub use rate_limit::*;
pub use retry::*;
pub use run::*;
pub use runtime::*;
pub use stage::*;
pub use store::*;
