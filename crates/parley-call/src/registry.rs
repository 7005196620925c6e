//! Room roster: who is currently in a call room.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use parley_store::{StorePath, StoreSubscription};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{CallError, CallResult};
use crate::paths::RoomPaths;
use crate::session_key::SessionKey;
use crate::signaling::now_millis;
use crate::transport::DualTransport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub user_name: String,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub session_key: SessionKey,
    pub user_id: String,
    pub user_name: String,
    pub joined_at_millis: u64,
}

/// Snapshot of a room's roster, ordered by session key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn from_entries(mut entries: Vec<RosterEntry>) -> Self {
        entries.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        entries.dedup_by(|a, b| a.session_key == b.session_key);
        Self { entries }
    }

    /// Parses the `sessions` subtree. Malformed entries are skipped.
    pub fn from_snapshot(snapshot: Option<Value>) -> Self {
        let Some(Value::Object(map)) = snapshot else {
            return Self::default();
        };
        let entries = map
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value::<RosterEntry>(value) {
                Ok(mut entry) => {
                    // The node name is authoritative.
                    entry.session_key = SessionKey::new(key);
                    Some(entry)
                }
                Err(err) => {
                    warn!(target = "parley::registry", session = %key, error = %err, "skipping malformed roster entry");
                    None
                }
            })
            .collect();
        Self::from_entries(entries)
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.entries.iter().any(|entry| &entry.session_key == key)
    }

    pub fn others<'a>(&'a self, me: &'a SessionKey) -> impl Iterator<Item = &'a RosterEntry> + 'a {
        self.entries.iter().filter(move |entry| &entry.session_key != me)
    }

    /// True when `me` is the only session left.
    pub fn is_alone(&self, me: &SessionKey) -> bool {
        self.others(me).next().is_none()
    }
}

pub struct SessionRegistry {
    transport: DualTransport,
    root: String,
    poll_interval: Duration,
    install_exit_hook: bool,
    exit_hooks: Mutex<HashMap<StorePath, JoinHandle<()>>>,
    interrupts: broadcast::Sender<SessionKey>,
}

impl SessionRegistry {
    pub fn new(
        transport: DualTransport,
        root: impl Into<String>,
        poll_interval: Duration,
        install_exit_hook: bool,
    ) -> Self {
        Self {
            transport,
            root: root.into(),
            poll_interval,
            install_exit_hook,
            exit_hooks: Mutex::new(HashMap::new()),
            interrupts: broadcast::channel(4).0,
        }
    }

    /// Sessions whose roster entry was removed because the process received
    /// ctrl-c. The process keeps running; exiting is up to the host.
    pub fn interrupts(&self) -> broadcast::Receiver<SessionKey> {
        self.interrupts.subscribe()
    }

    fn paths(&self, room: &str) -> CallResult<RoomPaths> {
        Ok(RoomPaths::new(&self.root, room)?)
    }

    /// Registers `key` in `room`. Re-joining overwrites the previous entry.
    ///
    /// The entry is also removed by the store when the connection drops and,
    /// with the exit hook enabled, on ctrl-c. Listening for ctrl-c replaces
    /// the default handler, so a host that wants to terminate on it should
    /// watch [`interrupts`](Self::interrupts) or the call's end notification.
    pub async fn join(
        &self,
        room: &str,
        key: &SessionKey,
        participant: &Participant,
    ) -> CallResult<()> {
        let path = self.paths(room)?.session(key)?;
        let entry = RosterEntry {
            session_key: key.clone(),
            user_id: participant.user_id.clone(),
            user_name: participant.user_name.clone(),
            joined_at_millis: now_millis(),
        };
        let value =
            serde_json::to_value(&entry).map_err(|err| CallError::RegistryWrite(err.to_string()))?;
        let route = self
            .transport
            .write(&path, value)
            .await
            .map_err(|err| CallError::RegistryWrite(err.to_string()))?;

        if let Err(err) = self.transport.remove_on_disconnect(&path).await {
            warn!(target = "parley::registry", %path, error = %err, "could not arm remove-on-disconnect");
        }
        if self.install_exit_hook {
            self.arm_exit_hook(key, path);
        }
        info!(target = "parley::registry", %room, session = %key, ?route, "joined room");
        Ok(())
    }

    /// Removes `key` from `room`. Safe to call when the entry is already gone.
    pub async fn leave(&self, room: &str, key: &SessionKey) -> CallResult<()> {
        let path = self.paths(room)?.session(key)?;
        if let Some(hook) = self.exit_hooks.lock().remove(&path) {
            hook.abort();
        }
        self.transport
            .delete(&path)
            .await
            .map_err(|err| CallError::RegistryWrite(err.to_string()))?;
        info!(target = "parley::registry", %room, session = %key, "left room");
        Ok(())
    }

    /// Streams roster snapshots for `room`. Push updates are backed by a
    /// periodic re-read; consecutive identical snapshots are collapsed.
    pub async fn subscribe(&self, room: &str) -> CallResult<RosterWatch> {
        let sessions = self.paths(room)?.sessions()?;
        let push = match self.transport.subscribe(&sessions).await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(target = "parley::registry", %room, error = %err, "roster push unavailable; polling only");
                None
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(watch_roster(
            self.transport.clone(),
            sessions,
            push,
            self.poll_interval,
            tx,
        ));
        Ok(RosterWatch { rx, task })
    }

    /// Deletes every roster entry in `room` except `except`. Returns how many
    /// entries were removed.
    pub async fn purge_others(&self, room: &str, except: &SessionKey) -> CallResult<usize> {
        let paths = self.paths(room)?;
        let snapshot = self
            .transport
            .read(&paths.sessions()?)
            .await
            .map_err(|err| CallError::RegistryWrite(err.to_string()))?;
        let stale: Vec<String> = match snapshot {
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(key, _)| key)
                .filter(|key| key != except.as_str())
                .collect(),
            _ => Vec::new(),
        };

        let mut removed = 0;
        for key in stale {
            let path = paths.session(&SessionKey::new(key.as_str()))?;
            match self.transport.delete(&path).await {
                Ok(_) => removed += 1,
                Err(err) => {
                    warn!(target = "parley::registry", session = %key, error = %err, "failed to purge roster entry")
                }
            }
        }
        info!(target = "parley::registry", %room, removed, "purged other sessions");
        Ok(removed)
    }

    fn arm_exit_hook(&self, key: &SessionKey, path: StorePath) {
        let mut hooks = self.exit_hooks.lock();
        if hooks.contains_key(&path) {
            return;
        }
        let transport = self.transport.clone();
        let interrupts = self.interrupts.clone();
        let key = key.clone();
        let hook_path = path.clone();
        let hook = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            clear_on_interrupt(&transport, &interrupts, key, &hook_path).await;
        });
        hooks.insert(path, hook);
    }
}

async fn clear_on_interrupt(
    transport: &DualTransport,
    interrupts: &broadcast::Sender<SessionKey>,
    key: SessionKey,
    path: &StorePath,
) {
    info!(target = "parley::registry", session = %key, "interrupted; removing roster entry");
    if let Err(err) = transport.delete(path).await {
        warn!(target = "parley::registry", %path, error = %err, "exit cleanup failed");
    }
    // Nobody listening is fine.
    let _ = interrupts.send(key);
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        for (_, hook) in self.exit_hooks.lock().drain() {
            hook.abort();
        }
    }
}

/// Receiving end of a roster subscription. Dropping it stops the watcher.
pub struct RosterWatch {
    rx: mpsc::UnboundedReceiver<Roster>,
    task: JoinHandle<()>,
}

impl RosterWatch {
    pub async fn next(&mut self) -> Option<Roster> {
        self.rx.recv().await
    }

    pub fn stop(&mut self) {
        self.task.abort();
    }
}

impl Drop for RosterWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_roster(
    transport: DualTransport,
    sessions: StorePath,
    mut push: Option<StoreSubscription>,
    poll_interval: Duration,
    tx: mpsc::UnboundedSender<Roster>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<Roster> = None;
    loop {
        let snapshot = tokio::select! {
            event = StoreSubscription::recv_or_pending(&mut push) => match event {
                Some(event) => event.value,
                None => {
                    push = None;
                    continue;
                }
            },
            _ = ticker.tick() => match transport.read(&sessions).await {
                Ok(value) => value,
                Err(err) => {
                    debug!(target = "parley::registry", path = %sessions, error = %err, "roster poll failed");
                    continue;
                }
            },
        };
        let roster = Roster::from_snapshot(snapshot);
        if last.as_ref() == Some(&roster) {
            continue;
        }
        last = Some(roster.clone());
        if tx.send(roster).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::muted_push::MutedPush;
    use parley_store::{MemoryConnection, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn registry(conn: MemoryConnection, store: &MemoryStore) -> SessionRegistry {
        let transport = DualTransport::new(
            Arc::new(conn),
            Some(Arc::new(store.fallback())),
            Duration::from_millis(200),
        );
        SessionRegistry::new(transport, "calls", Duration::from_millis(50), false)
    }

    fn sessions_path() -> StorePath {
        RoomPaths::new("calls", "r1").unwrap().sessions().unwrap()
    }

    async fn next_roster(watch: &mut RosterWatch) -> Roster {
        timeout(WAIT, watch.next()).await.expect("roster update").expect("watch open")
    }

    #[test]
    fn roster_parses_snapshot_and_skips_garbage() {
        let roster = Roster::from_snapshot(Some(json!({
            "user2_xyz": {"sessionKey": "user2_xyz", "userId": "user2", "userName": "Bo", "joinedAtMillis": 2},
            "user1_abc": {"sessionKey": "ignored", "userId": "user1", "userName": "Al", "joinedAtMillis": 1},
            "junk": 5
        })));
        let keys: Vec<&str> = roster.entries().iter().map(|e| e.session_key.as_str()).collect();
        assert_eq!(keys, vec!["user1_abc", "user2_xyz"]);

        let me = SessionKey::new("user1_abc");
        assert!(!roster.is_alone(&me));
        assert_eq!(roster.others(&me).count(), 1);
        assert!(Roster::from_snapshot(None).is_empty());
    }

    #[tokio::test]
    async fn join_subscribe_leave() {
        let store = MemoryStore::new();
        let registry = registry(store.connect(), &store);
        let me = SessionKey::new("user1_abc");
        let mut watch = registry.subscribe("r1").await.unwrap();
        assert!(next_roster(&mut watch).await.is_empty());

        registry
            .join("r1", &me, &Participant::new("user1", "Al"))
            .await
            .unwrap();
        let roster = next_roster(&mut watch).await;
        assert!(roster.contains(&me));
        assert!(roster.is_alone(&me));

        registry.leave("r1", &me).await.unwrap();
        assert!(next_roster(&mut watch).await.is_empty());
        // Leaving twice is harmless.
        registry.leave("r1", &me).await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_removes_entry() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let registry = registry(conn.clone(), &store);
        let me = SessionKey::new("user1_abc");
        registry
            .join("r1", &me, &Participant::new("user1", "Al"))
            .await
            .unwrap();
        assert!(store.snapshot(&sessions_path()).is_some());

        conn.disconnect();
        assert!(store.snapshot(&sessions_path()).is_none());
    }

    #[tokio::test]
    async fn interrupt_clears_entry_and_leaves_exit_to_host() {
        let store = MemoryStore::new();
        let registry = registry(store.connect(), &store);
        let me = SessionKey::new("user1_abc");
        let mut interrupts = registry.interrupts();
        registry
            .join("r1", &me, &Participant::new("user1", "Al"))
            .await
            .unwrap();

        let entry = sessions_path().child(&me).unwrap();
        clear_on_interrupt(&registry.transport, &registry.interrupts, me.clone(), &entry).await;

        assert!(store.snapshot(&sessions_path()).is_none());
        assert_eq!(timeout(WAIT, interrupts.recv()).await.unwrap().unwrap(), me);
    }

    #[tokio::test]
    async fn join_fails_when_both_transports_fail() {
        let store = MemoryStore::new();
        let conn = store.connect();
        conn.set_offline(true);
        let fallback = store.fallback();
        fallback.set_offline(true);
        let transport =
            DualTransport::new(Arc::new(conn), Some(Arc::new(fallback)), Duration::from_millis(50));
        let registry = SessionRegistry::new(transport, "calls", Duration::from_secs(1), false);
        let err = registry
            .join("r1", &SessionKey::new("user1_abc"), &Participant::new("user1", "Al"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::RegistryWrite(_)));
    }

    #[tokio::test]
    async fn purge_keeps_only_caller() {
        let store = MemoryStore::new();
        let registry = registry(store.connect(), &store);
        let me = SessionKey::new("user1_abc");
        for key in ["user1_abc", "ghost_1", "ghost_2"] {
            registry
                .join("r1", &SessionKey::new(key), &Participant::new("u", "U"))
                .await
                .unwrap();
        }
        assert_eq!(registry.purge_others("r1", &me).await.unwrap(), 2);
        let roster = Roster::from_snapshot(store.snapshot(&sessions_path()));
        assert_eq!(roster.len(), 1);
        assert!(roster.contains(&me));
        assert_eq!(registry.purge_others("r1", &me).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn polling_backs_up_silent_push() {
        let store = MemoryStore::new();
        let transport = DualTransport::new(
            Arc::new(MutedPush::new(store.connect())),
            None,
            Duration::from_millis(200),
        );
        let watcher = SessionRegistry::new(transport, "calls", Duration::from_millis(40), false);
        let writer = registry(store.connect(), &store);

        let mut watch = watcher.subscribe("r1").await.unwrap();
        assert!(next_roster(&mut watch).await.is_empty());
        writer
            .join("r1", &SessionKey::new("user2_xyz"), &Participant::new("user2", "Bo"))
            .await
            .unwrap();
        let roster = next_roster(&mut watch).await;
        assert_eq!(roster.len(), 1);
        // Unchanged snapshots are not repeated.
        assert!(timeout(Duration::from_millis(200), watch.next()).await.is_err());
    }
}
