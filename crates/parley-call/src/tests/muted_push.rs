use async_trait::async_trait;
use parking_lot::Mutex;
use parley_store::{
    MemoryConnection, RealtimeStore, StoreEvent, StorePath, StoreResult, StoreSubscription,
};
use serde_json::Value;
use tokio::sync::broadcast;

/// A realtime store whose push subscriptions open fine but never deliver,
/// so only polling can observe changes.
pub(crate) struct MutedPush {
    inner: MemoryConnection,
    silent: Mutex<Vec<broadcast::Sender<StoreEvent>>>,
}

impl MutedPush {
    pub(crate) fn new(inner: MemoryConnection) -> Self {
        Self {
            inner,
            silent: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RealtimeStore for MutedPush {
    async fn write(&self, path: &StorePath, value: Value) -> StoreResult<()> {
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

    async fn subscribe(&self, _path: &StorePath) -> StoreResult<StoreSubscription> {
        let (tx, rx) = broadcast::channel(1);
        self.silent.lock().push(tx);
        Ok(StoreSubscription::new(None, rx))
    }

    async fn remove_on_disconnect(&self, path: &StorePath) -> StoreResult<()> {
        self.inner.remove_on_disconnect(path).await
    }
}
