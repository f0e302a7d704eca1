use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::context::ContextHandle;
use crate::error::RunError;
use crate::run::{AnalysisRun, RunId, RunStatus};
use crate::stage::StageResult;

/// Trait for backends that persist analysis runs.
///
/// The orchestrator writes through this trait at fan-in, so the stage map and
/// run status can be queried while a run is still in flight.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a freshly created run. Fails with [`RunError::DuplicateRun`] if
    /// the id is already taken.
    async fn create(&self, run: AnalysisRun) -> anyhow::Result<()>;

    /// Snapshot of a run, or `None` if the id is unknown.
    async fn get(&self, run_id: RunId) -> anyhow::Result<Option<AnalysisRun>>;

    /// Record a terminal stage result.
    async fn record_stage(&self, run_id: RunId, result: StageResult) -> anyhow::Result<()>;

    /// Move the run to `status`, keeping `failure` as the diagnostic cause.
    async fn transition(
        &self,
        run_id: RunId,
        status: RunStatus,
        failure: Option<String>,
    ) -> anyhow::Result<()>;

    /// Attach or clear the run's context handle.
    async fn set_context(&self, run_id: RunId, handle: Option<ContextHandle>) -> anyhow::Result<()>;

    /// Ids of every run known to the store.
    async fn run_ids(&self) -> anyhow::Result<Vec<RunId>>;
}

/// Process-local run store.
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<Mutex<HashMap<RunId, AnalysisRun>>>,
}

impl std::fmt::Debug for InMemoryRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryRunStore");
        match self.runs.try_lock() {
            Ok(runs) => {
                debug.field("runs", &runs.len());
            }
            Err(_) => {
                debug.field("runs", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: AnalysisRun) -> anyhow::Result<()> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&run.run_id) {
            return Err(RunError::DuplicateRun(run.run_id).into());
        }
        runs.insert(run.run_id, run);
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> anyhow::Result<Option<AnalysisRun>> {
        Ok(self.runs.lock().await.get(&run_id).cloned())
    }

    async fn record_stage(&self, run_id: RunId, result: StageResult) -> anyhow::Result<()> {
        let mut runs = self.runs.lock().await;
        let run = runs.get_mut(&run_id).ok_or(RunError::UnknownRun(run_id))?;
        run.stages.insert(result.stage.clone(), result);
        Ok(())
    }

    async fn transition(
        &self,
        run_id: RunId,
        status: RunStatus,
        failure: Option<String>,
    ) -> anyhow::Result<()> {
        let mut runs = self.runs.lock().await;
        let run = runs.get_mut(&run_id).ok_or(RunError::UnknownRun(run_id))?;
        run.transition(status)?;
        if failure.is_some() {
            run.failure = failure;
        }
        Ok(())
    }

    async fn set_context(&self, run_id: RunId, handle: Option<ContextHandle>) -> anyhow::Result<()> {
        let mut runs = self.runs.lock().await;
        let run = runs.get_mut(&run_id).ok_or(RunError::UnknownRun(run_id))?;
        run.context = handle;
        Ok(())
    }

    async fn run_ids(&self) -> anyhow::Result<Vec<RunId>> {
        let runs = self.runs.lock().await;
        let mut ids: Vec<RunId> = runs.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
