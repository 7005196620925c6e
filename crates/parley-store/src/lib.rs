//! Store capabilities consumed by the call core.
//!
//! The realtime store is addressed by hierarchical [`StorePath`]s and offers
//! per-key atomic writes, subtree subscriptions and server-side
//! remove-on-disconnect rules. The fallback transport is a plain
//! request/response view over the same paths, used when the realtime store
//! errors or stalls.

mod http;
mod memory;
mod path;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

pub use http::HttpFallback;
pub use memory::{MemoryConnection, MemoryFallback, MemoryStore};
pub use path::StorePath;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out")]
    Timeout,
    #[error("http request failed ({status:?}): {message}")]
    Http {
        status: Option<u16>,
        message: String,
    },
    #[error("invalid store path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("store codec error: {0}")]
    Codec(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Snapshot of a subscribed subtree after a change at or below it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub path: StorePath,
    pub value: Option<Value>,
}

/// Live view of one subtree. Yields the current snapshot first, then one
/// snapshot per change.
pub struct StoreSubscription {
    initial: Option<StoreEvent>,
    rx: broadcast::Receiver<StoreEvent>,
}

impl StoreSubscription {
    pub fn new(initial: Option<StoreEvent>, rx: broadcast::Receiver<StoreEvent>) -> Self {
        Self { initial, rx }
    }

    /// Returns `None` once the store side of the subscription is gone.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        if let Some(event) = self.initial.take() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                // Every event is a full snapshot, so skipping lagged ones loses nothing.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(target = "parley::store", skipped, "subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Like [`recv`](Self::recv) on an optional subscription; never resolves
    /// when there is none, so a closed push source can sit in a `select!`.
    pub async fn recv_or_pending(subscription: &mut Option<Self>) -> Option<StoreEvent> {
        match subscription {
            Some(subscription) => subscription.recv().await,
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
pub trait RealtimeStore: Send + Sync {
    async fn write(&self, path: &StorePath, value: Value) -> StoreResult<()>;
    /// Merges the fields of `partial` into the object at `path`; `null` fields are removed.
    async fn update(&self, path: &StorePath, partial: Value) -> StoreResult<()>;
    async fn delete(&self, path: &StorePath) -> StoreResult<()>;
    async fn read_once(&self, path: &StorePath) -> StoreResult<Option<Value>>;
    async fn subscribe(&self, path: &StorePath) -> StoreResult<StoreSubscription>;
    /// Asks the server to delete `path` when this client's connection drops.
    async fn remove_on_disconnect(&self, path: &StorePath) -> StoreResult<()>;
}

#[async_trait]
pub trait FallbackTransport: Send + Sync {
    async fn get(&self, path: &StorePath) -> StoreResult<Option<Value>>;
    async fn put(&self, path: &StorePath, value: Value) -> StoreResult<()>;
    /// Appends `value` under a server-generated child key and returns that key.
    async fn post(&self, path: &StorePath, value: Value) -> StoreResult<String>;
    async fn patch(&self, path: &StorePath, partial: Value) -> StoreResult<()>;
    async fn delete(&self, path: &StorePath) -> StoreResult<()>;
}
