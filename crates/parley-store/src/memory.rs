use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::{
    FallbackTransport, RealtimeStore, StoreError, StoreEvent, StorePath, StoreResult,
    StoreSubscription,
};

const WATCH_CAPACITY: usize = 64;

/// In-memory realtime store shared by every connection created from it.
///
/// Each [`MemoryConnection`] behaves like one client socket: it can be taken
/// offline, stalled, or dropped (which fires its remove-on-disconnect rules).
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    tree: RwLock<Value>,
    watchers: RwLock<HashMap<StorePath, broadcast::Sender<StoreEvent>>>,
    disconnect_rules: Mutex<HashMap<u64, Vec<StorePath>>>,
    next_connection: AtomicU64,
    next_key: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            id: self.shared.next_connection.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(&self.shared),
            link: Arc::new(LinkState::default()),
        }
    }

    pub fn fallback(&self) -> MemoryFallback {
        MemoryFallback {
            shared: Arc::clone(&self.shared),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn snapshot(&self, path: &StorePath) -> Option<Value> {
        self.shared.read(path)
    }

    /// Number of subtrees that still have live subscribers.
    pub fn watched_paths(&self) -> usize {
        self.shared.prune_watchers();
        self.shared.watchers.read().len()
    }
}

impl Shared {
    fn read(&self, path: &StorePath) -> Option<Value> {
        get_at(&self.tree.read(), path.segments()).cloned()
    }

    fn set(&self, path: &StorePath, value: Value) {
        {
            let mut tree = self.tree.write();
            set_at(&mut tree, path.segments(), value);
        }
        self.notify(path);
    }

    fn merge(&self, path: &StorePath, partial: Value) -> StoreResult<()> {
        let Value::Object(fields) = partial else {
            return Err(StoreError::Codec("update payload must be an object".into()));
        };
        {
            let mut tree = self.tree.write();
            for (key, value) in fields {
                let mut segments = path.segments().to_vec();
                segments.push(key);
                set_at(&mut tree, &segments, value);
            }
        }
        self.notify(path);
        Ok(())
    }

    fn generate_key(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let seq = self.next_key.fetch_add(1, Ordering::Relaxed);
        format!("{millis:013}-{seq:06}")
    }

    fn notify(&self, changed: &StorePath) {
        let targets: Vec<(StorePath, broadcast::Sender<StoreEvent>)> = self
            .watchers
            .read()
            .iter()
            .filter(|(watched, _)| watched.overlaps(changed))
            .map(|(watched, sender)| (watched.clone(), sender.clone()))
            .collect();
        let mut stale = false;
        for (watched, sender) in targets {
            let event = StoreEvent {
                value: self.read(&watched),
                path: watched,
            };
            stale |= sender.send(event).is_err();
        }
        if stale {
            self.prune_watchers();
        }
    }

    fn prune_watchers(&self) {
        self.watchers
            .write()
            .retain(|_, sender| sender.receiver_count() > 0);
    }

    fn run_disconnect_rules(&self, connection: u64) {
        let paths = self
            .disconnect_rules
            .lock()
            .remove(&connection)
            .unwrap_or_default();
        for path in paths {
            tracing::debug!(target = "parley::store", connection, %path, "disconnect rule fired");
            self.set(&path, Value::Null);
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    offline: AtomicBool,
    stalled: AtomicBool,
}

/// One client's view of a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    link: Arc<LinkState>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Offline connections fail every operation with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.link.offline.store(offline, Ordering::SeqCst);
    }

    /// Stalled connections never complete an operation.
    pub fn set_stalled(&self, stalled: bool) {
        self.link.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Simulates the socket dropping: the server applies this connection's
    /// remove-on-disconnect rules.
    pub fn disconnect(&self) {
        self.shared.run_disconnect_rules(self.id);
    }

    async fn gate(&self) -> StoreResult<()> {
        if self.link.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.link.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "connection {} is offline",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RealtimeStore for MemoryConnection {
    async fn write(&self, path: &StorePath, value: Value) -> StoreResult<()> {
        self.gate().await?;
        self.shared.set(path, value);
        Ok(())
    }

    async fn update(&self, path: &StorePath, partial: Value) -> StoreResult<()> {
        self.gate().await?;
        self.shared.merge(path, partial)
    }

    async fn delete(&self, path: &StorePath) -> StoreResult<()> {
        self.gate().await?;
        self.shared.set(path, Value::Null);
        Ok(())
    }

    async fn read_once(&self, path: &StorePath) -> StoreResult<Option<Value>> {
        self.gate().await?;
        Ok(self.shared.read(path))
    }

    async fn subscribe(&self, path: &StorePath) -> StoreResult<StoreSubscription> {
        self.gate().await?;
        let rx = self
            .shared
            .watchers
            .write()
            .entry(path.clone())
            .or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0)
            .subscribe();
        let initial = StoreEvent {
            path: path.clone(),
            value: self.shared.read(path),
        };
        Ok(StoreSubscription::new(Some(initial), rx))
    }

    async fn remove_on_disconnect(&self, path: &StorePath) -> StoreResult<()> {
        self.gate().await?;
        let mut rules = self.shared.disconnect_rules.lock();
        let paths = rules.entry(self.id).or_default();
        if !paths.contains(path) {
            paths.push(path.clone());
        }
        Ok(())
    }
}

/// Request/response access to the same tree as the [`MemoryStore`] it came from.
#[derive(Debug, Clone)]
pub struct MemoryFallback {
    shared: Arc<Shared>,
    offline: Arc<AtomicBool>,
}

impl MemoryFallback {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn gate(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Http {
                status: None,
                message: "fallback transport offline".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FallbackTransport for MemoryFallback {
    async fn get(&self, path: &StorePath) -> StoreResult<Option<Value>> {
        self.gate()?;
        Ok(self.shared.read(path))
    }

    async fn put(&self, path: &StorePath, value: Value) -> StoreResult<()> {
        self.gate()?;
        self.shared.set(path, value);
        Ok(())
    }

    async fn post(&self, path: &StorePath, value: Value) -> StoreResult<String> {
        self.gate()?;
        let key = self.shared.generate_key();
        self.shared.set(&path.child(&key)?, value);
        Ok(key)
    }

    async fn patch(&self, path: &StorePath, partial: Value) -> StoreResult<()> {
        self.gate()?;
        self.shared.merge(path, partial)
    }

    async fn delete(&self, path: &StorePath) -> StoreResult<()> {
        self.gate()?;
        self.shared.set(path, Value::Null);
        Ok(())
    }
}

fn get_at<'a>(tree: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = tree;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    (!node.is_null()).then_some(node)
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn set_at(tree: &mut Value, segments: &[String], value: Value) {
    if value.is_null() {
        if remove_at(tree, segments) {
            *tree = Value::Null;
        }
        return;
    }
    let Some((last, parents)) = segments.split_last() else {
        *tree = value;
        return;
    };
    let mut node = tree;
    for segment in parents {
        node = ensure_object(node)
            .entry(segment.clone())
            .or_insert(Value::Null);
    }
    ensure_object(node).insert(last.clone(), value);
}

/// Removes the value at `segments`, pruning parents left empty. Returns true
/// when `node` itself ended up empty.
fn remove_at(node: &mut Value, segments: &[String]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return true;
    };
    let Value::Object(map) = node else {
        return node.is_null();
    };
    if rest.is_empty() {
        map.remove(first);
    } else if let Some(child) = map.get_mut(first) {
        if remove_at(child, rest) {
            map.remove(first);
        }
    }
    map.is_empty()
}
