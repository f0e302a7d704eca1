//! Per-run reusable execution context.
//!
//! Stages that would otherwise rebuild the same expensive shared state (a
//! large document bundle for repeated model calls, say) receive a
//! [`ContextHandle`] instead. The handle points at state persisted through a
//! [`ContextStore`] and lives for a fixed TTL.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::run::RunId;

/// Opaque reference to cached per-run state. Never mutated after creation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContextHandle {
    pub reference: String,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ContextHandle {
    /// The expiry instant itself is already outside the handle's lifetime.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at < self.expires_at
    }
}

/// Entry persisted by a context store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredContext {
    pub handle: ContextHandle,
    pub seed: Value,
}

/// Backing store for run contexts (object store, cache, ...).
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn put(&self, entry: StoredContext) -> anyhow::Result<()>;

    async fn get(&self, run_id: RunId) -> anyhow::Result<Option<StoredContext>>;

    async fn remove(&self, run_id: RunId) -> anyhow::Result<bool>;

    /// Drop every entry whose TTL elapsed at `now`. Returns how many were dropped.
    async fn purge_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize>;
}

/// Process-local context store.
#[derive(Clone, Default, Debug)]
pub struct InMemoryContextStore {
    inner: Arc<Mutex<HashMap<RunId, StoredContext>>>,
}

impl InMemoryContextStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contexts held, expired ones included.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn put(&self, entry: StoredContext) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().await;
        guard.insert(entry.handle.run_id, entry);
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> anyhow::Result<Option<StoredContext>> {
        let guard = self.inner.lock().await;
        Ok(guard.get(&run_id).cloned())
    }

    async fn remove(&self, run_id: RunId) -> anyhow::Result<bool> {
        let mut guard = self.inner.lock().await;
        Ok(guard.remove(&run_id).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut guard = self.inner.lock().await;
        let before = guard.len();
        guard.retain(|_, entry| entry.handle.is_valid_at(now));
        Ok(before - guard.len())
    }
}

/// Creates and resolves per-run context handles with a fixed TTL.
#[derive(Clone)]
pub struct RunContext {
    store: Arc<dyn ContextStore>,
    ttl: Duration,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("ttl_secs", &self.ttl.num_seconds())
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Create a context service issuing handles valid for `ttl`.
    pub fn new(store: Arc<dyn ContextStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a context valid from now. Replaces any previous one for the run.
    pub async fn create(&self, run_id: RunId, seed_data: Value) -> anyhow::Result<ContextHandle> {
        self.create_at(run_id, seed_data, Utc::now()).await
    }

    /// Create a context as of `now`. Any previous context for the run is replaced.
    pub async fn create_at(
        &self,
        run_id: RunId,
        seed_data: Value,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ContextHandle> {
        let handle = ContextHandle {
            reference: format!("ctx-{}", Uuid::now_v7()),
            run_id,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.store
            .put(StoredContext {
                handle: handle.clone(),
                seed: seed_data,
            })
            .await?;
        info!(run_id = %run_id, reference = %handle.reference, expires_at = %handle.expires_at, "run context created");
        Ok(handle)
    }

    /// Returns `None` (NotFound) when no context exists or its TTL elapsed.
    pub async fn get(&self, run_id: RunId) -> anyhow::Result<Option<ContextHandle>> {
        self.get_at(run_id, Utc::now()).await
    }

    /// Like [`get`](Self::get), evaluating expiry as of `now`.
    pub async fn get_at(
        &self,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ContextHandle>> {
        match self.store.get(run_id).await? {
            Some(entry) if entry.handle.is_valid_at(now) => Ok(Some(entry.handle)),
            Some(entry) => {
                debug!(run_id = %run_id, reference = %entry.handle.reference, "run context expired");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Explicit run-completion cleanup.
    pub async fn release(&self, run_id: RunId) -> anyhow::Result<bool> {
        self.store.remove(run_id).await
    }
}
