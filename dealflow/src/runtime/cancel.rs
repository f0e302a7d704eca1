use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::select_all;
use tokio::sync::Notify;

/// Cooperative cancellation signal shared by a run and its stage tasks.
///
/// Cancelling is idempotent and never un-done.
///
/// A token made with [`CancelToken::child`] observes its parent's
/// cancellation, but cancelling the child leaves the parent untouched.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<CancelTokenInner>,
    ancestors: Vec<Arc<CancelTokenInner>>,
}

#[derive(Debug, Default)]
struct CancelTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelTokenInner::default()),
            ancestors: Vec::new(),
        }
    }

    /// Create a token cancelled whenever `self` is, that can also be
    /// cancelled on its own without affecting `self`.
    pub fn child(&self) -> Self {
        let mut ancestors = Vec::with_capacity(self.ancestors.len() + 1);
        ancestors.push(Arc::clone(&self.inner));
        ancestors.extend(self.ancestors.iter().cloned());
        Self {
            inner: Arc::new(CancelTokenInner::default()),
            ancestors,
        }
    }

    /// Signal cancellation to this token and its children.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once this token or any ancestor was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.lineage()
            .any(|inner| inner.cancelled.load(Ordering::SeqCst))
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let mut waits: Vec<_> = self
            .lineage()
            .map(|inner| Box::pin(inner.notify.notified()))
            .collect();
        // register before checking so a cancel in between is not missed
        for wait in &mut waits {
            wait.as_mut().enable();
        }
        if self.is_cancelled() {
            return;
        }
        select_all(waits).await;
    }

    fn lineage(&self) -> impl Iterator<Item = &Arc<CancelTokenInner>> {
        std::iter::once(&self.inner).chain(self.ancestors.iter())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
