use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parley_store::{
    MemoryConnection, RealtimeStore, StoreError, StorePath, StoreResult, StoreSubscription,
};
use serde_json::Value;

/// A realtime store that rejects the first few writes below any path
/// containing `segment`. Everything else goes straight to the inner
/// connection.
pub(crate) struct FailingWrites {
    inner: MemoryConnection,
    segment: &'static str,
    remaining: AtomicUsize,
}

impl FailingWrites {
    pub(crate) fn new(inner: MemoryConnection, segment: &'static str, failures: usize) -> Self {
        Self {
            inner,
            segment,
            remaining: AtomicUsize::new(failures),
        }
    }

    fn reject(&self, path: &StorePath) -> bool {
        path.segments().iter().any(|s| s == self.segment)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl RealtimeStore for FailingWrites {
    async fn write(&self, path: &StorePath, value: Value) -> StoreResult<()> {
        if self.reject(path) {
            return Err(StoreError::Unavailable(format!("write to {path} rejected")));
        }
        self.inner.write(path, value).await
    }

    async fn update(&self, path: &StorePath, partial: Value) -> StoreResult<()> {
        self.inner.update(path, partial).await
    }

    async fn delete(&self, path: &StorePath) -> StoreResult<()> {
        self.inner.delete(path).await
    }

    async fn read_once(&self, path: &StorePath) -> StoreResult<Option<Value>> {
        self.inner.read_once(path).await
    }

    async fn subscribe(&self, path: &StorePath) -> StoreResult<StoreSubscription> {
        self.inner.subscribe(path).await
    }

    async fn remove_on_disconnect(&self, path: &StorePath) -> StoreResult<()> {
        self.inner.remove_on_disconnect(path).await
    }
}
