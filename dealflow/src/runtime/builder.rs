use std::fmt;
use std::sync::Arc;

use crate::client::{CredentialProvider, NoCredentials, StageClient, StageTransport};
use crate::config::PipelineConfig;
use crate::context::{ContextStore, InMemoryContextStore, RunContext};
use crate::events::{ObservabilitySink, TracingSink};
use crate::graph::PipelineGraph;
use crate::rate_limit::{RateLimiter, SlidingWindowRateLimiter};
use crate::store::{InMemoryRunStore, RunStore};

use super::orchestrator::PipelineOrchestrator;

/// Builder for constructing a [`PipelineOrchestrator`] with explicit dependencies.
///
/// Only the transport is mandatory. Everything else falls back to an
/// in-process default derived from the [`PipelineConfig`]:
///
/// | dependency     | default                                   |
/// |----------------|-------------------------------------------|
/// | graph          | [`PipelineGraph::standard`]               |
/// | rate limiter   | [`SlidingWindowRateLimiter`] from config  |
/// | context store  | [`InMemoryContextStore`]                  |
/// | credentials    | [`NoCredentials`]                         |
/// | sink           | [`TracingSink`]                           |
/// | run store      | [`InMemoryRunStore`]                      |
///
/// # Example
///
/// ```ignore
/// use dealflow::*;
///
/// let orchestrator = PipelineOrchestratorBuilder::new(PipelineConfig::default())
///     .with_transport(transport)
///     .with_credentials(Arc::new(StaticCredentials::new(token)))
///     .with_sink(bus.clone())
///     .build()?;
/// let report = orchestrator.run(SubjectIds::new("ACME", "GLOBEX")).await?;
/// ```
pub struct PipelineOrchestratorBuilder {
    config: PipelineConfig,
    graph: Option<PipelineGraph>,
    transport: Option<Arc<dyn StageTransport>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    context_store: Option<Arc<dyn ContextStore>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    sink: Option<Arc<dyn ObservabilitySink>>,
    store: Option<Arc<dyn RunStore>>,
}

impl fmt::Debug for PipelineOrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestratorBuilder")
            .field("config", &self.config)
            .field("graph_set", &self.graph.is_some())
            .field("transport_set", &self.transport.is_some())
            .field("rate_limiter_set", &self.rate_limiter.is_some())
            .field("context_store_set", &self.context_store.is_some())
            .field("credentials_set", &self.credentials.is_some())
            .field("sink_set", &self.sink.is_some())
            .field("store_set", &self.store.is_some())
            .finish()
    }
}

impl Default for PipelineOrchestratorBuilder {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl PipelineOrchestratorBuilder {
    /// Start a builder with in-memory stores, no credentials and the standard graph.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            graph: None,
            transport: None,
            rate_limiter: None,
            context_store: None,
            credentials: None,
            sink: None,
            store: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `graph` instead of [`PipelineGraph::standard`].
    pub fn with_graph(mut self, graph: PipelineGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Required. [`build`](Self::build) fails without a transport.
    pub fn with_transport(mut self, transport: Arc<dyn StageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share a limiter across orchestrators hitting the same upstream API.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_context_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.context_store = Some(store);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Receive run, stage and attempt events.
    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is missing, the config is invalid
    /// or the standard graph fails validation.
    pub fn build(self) -> anyhow::Result<PipelineOrchestrator> {
        self.config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| anyhow::anyhow!("transport dependency missing"))?;
        let graph = match self.graph {
            Some(graph) => graph,
            None => PipelineGraph::standard()?,
        };
        let rate_limiter = self.rate_limiter.unwrap_or_else(|| {
            Arc::new(SlidingWindowRateLimiter::new(self.config.rate_limit.clone()))
        });
        let context_store = self
            .context_store
            .unwrap_or_else(|| Arc::new(InMemoryContextStore::new()));
        let credentials = self.credentials.unwrap_or_else(|| Arc::new(NoCredentials));
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryRunStore::new()));

        let client = StageClient::new(transport, credentials, Arc::clone(&sink))
            .with_rate_limiter(rate_limiter);
        let context = RunContext::new(context_store, self.config.context_ttl());

        Ok(PipelineOrchestrator::new(
            Arc::new(graph),
            Arc::new(client),
            context,
            store,
            sink,
            self.config,
        ))
    }
}
