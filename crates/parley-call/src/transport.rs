use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parley_store::{
    FallbackTransport, RealtimeStore, StoreError, StorePath, StoreResult, StoreSubscription,
};
use serde_json::Value;
use tracing::warn;

/// Which transport carried an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    Fallback,
}

/// Realtime store with a bounded-time primary attempt and a request/response
/// fallback over the same paths.
#[derive(Clone)]
pub struct DualTransport {
    primary: Arc<dyn RealtimeStore>,
    fallback: Option<Arc<dyn FallbackTransport>>,
    timeout: Duration,
}

impl DualTransport {
    pub fn new(
        primary: Arc<dyn RealtimeStore>,
        fallback: Option<Arc<dyn FallbackTransport>>,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            timeout,
        }
    }

    pub async fn write(&self, path: &StorePath, value: Value) -> StoreResult<Route> {
        let primary_err = match self.attempt(self.primary.write(path, value.clone())).await {
            Ok(()) => return Ok(Route::Primary),
            Err(err) => err,
        };
        let fallback = self.fallback_after("write", path, primary_err.clone())?;
        fallback
            .put(path, value)
            .await
            .map(|_| Route::Fallback)
            .map_err(|err| both_failed(&primary_err, &err))
    }

    pub async fn update(&self, path: &StorePath, partial: Value) -> StoreResult<Route> {
        let primary_err = match self.attempt(self.primary.update(path, partial.clone())).await {
            Ok(()) => return Ok(Route::Primary),
            Err(err) => err,
        };
        let fallback = self.fallback_after("update", path, primary_err.clone())?;
        fallback
            .patch(path, partial)
            .await
            .map(|_| Route::Fallback)
            .map_err(|err| both_failed(&primary_err, &err))
    }

    pub async fn delete(&self, path: &StorePath) -> StoreResult<Route> {
        let primary_err = match self.attempt(self.primary.delete(path)).await {
            Ok(()) => return Ok(Route::Primary),
            Err(err) => err,
        };
        let fallback = self.fallback_after("delete", path, primary_err.clone())?;
        fallback
            .delete(path)
            .await
            .map(|_| Route::Fallback)
            .map_err(|err| both_failed(&primary_err, &err))
    }

    pub async fn read(&self, path: &StorePath) -> StoreResult<Option<Value>> {
        let primary_err = match self.attempt(self.primary.read_once(path)).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let fallback = self.fallback_after("read", path, primary_err.clone())?;
        fallback
            .get(path)
            .await
            .map_err(|err| both_failed(&primary_err, &err))
    }

    /// Push subscriptions exist only on the primary store.
    pub async fn subscribe(&self, path: &StorePath) -> StoreResult<StoreSubscription> {
        self.attempt(self.primary.subscribe(path)).await
    }

    /// Disconnect rules exist only on the primary store.
    pub async fn remove_on_disconnect(&self, path: &StorePath) -> StoreResult<()> {
        self.attempt(self.primary.remove_on_disconnect(path)).await
    }

    async fn attempt<T>(&self, op: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        tokio::time::timeout(self.timeout, op)
            .await
            .unwrap_or(Err(StoreError::Timeout))
    }

    fn fallback_after(
        &self,
        op: &'static str,
        path: &StorePath,
        primary_err: StoreError,
    ) -> StoreResult<&Arc<dyn FallbackTransport>> {
        let Some(fallback) = &self.fallback else {
            return Err(primary_err);
        };
        warn!(
            target = "parley::transport",
            op,
            %path,
            error = %primary_err,
            "primary store failed; using fallback transport"
        );
        Ok(fallback)
    }
}

fn both_failed(primary: &StoreError, fallback: &StoreError) -> StoreError {
    StoreError::Unavailable(format!("primary: {primary}; fallback: {fallback}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::{MemoryConnection, MemoryFallback, MemoryStore};
    use serde_json::json;

    fn path(raw: &str) -> StorePath {
        StorePath::parse(raw).unwrap()
    }

    fn dual(store: &MemoryStore) -> (DualTransport, MemoryConnection, MemoryFallback) {
        let conn = store.connect();
        let fallback = store.fallback();
        let transport = DualTransport::new(
            Arc::new(conn.clone()),
            Some(Arc::new(fallback.clone())),
            Duration::from_millis(50),
        );
        (transport, conn, fallback)
    }

    #[tokio::test]
    async fn uses_primary_when_healthy() {
        let store = MemoryStore::new();
        let (transport, _conn, _fallback) = dual(&store);
        let route = transport.write(&path("a/b"), json!(1)).await.unwrap();
        assert_eq!(route, Route::Primary);
        assert_eq!(transport.read(&path("a/b")).await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn falls_back_on_error_and_on_timeout() {
        let store = MemoryStore::new();
        let (transport, conn, _fallback) = dual(&store);

        conn.set_offline(true);
        let route = transport.write(&path("a/b"), json!(1)).await.unwrap();
        assert_eq!(route, Route::Fallback);

        conn.set_offline(false);
        conn.set_stalled(true);
        let route = transport
            .update(&path("a"), json!({"c": 2}))
            .await
            .unwrap();
        assert_eq!(route, Route::Fallback);
        assert_eq!(transport.read(&path("a")).await.unwrap(), Some(json!({"b": 1, "c": 2})));
        assert_eq!(transport.delete(&path("a")).await.unwrap(), Route::Fallback);
        assert!(store.snapshot(&path("a")).is_none());
    }

    #[tokio::test]
    async fn reports_when_both_paths_fail() {
        let store = MemoryStore::new();
        let (transport, conn, fallback) = dual(&store);
        conn.set_offline(true);
        fallback.set_offline(true);
        let err = transport.write(&path("a"), json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(message) if message.contains("fallback")));
    }

    #[tokio::test]
    async fn without_fallback_primary_error_is_returned() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let transport = DualTransport::new(Arc::new(conn.clone()), None, Duration::from_millis(50));
        conn.set_stalled(true);
        let err = transport.delete(&path("a")).await.unwrap_err();
        assert_eq!(err, StoreError::Timeout);
    }
}
