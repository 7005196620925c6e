//! Per-session signaling inboxes on top of [`DualTransport`].
//!
//! Every session owns `signals/{sessionKey}` in its room. Senders write each
//! message under a fresh, time-ordered id; the owner consumes its inbox from
//! two sources at once (push notifications and a polling loop), delivers each
//! id exactly once and deletes consumed messages.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parley_store::{StorePath, StoreSubscription};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{CallError, CallResult};
use crate::media::IceCandidate;
use crate::paths::RoomPaths;
use crate::session_key::SessionKey;
use crate::transport::DualTransport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_mline_index: Option<u16>,
    },
}

impl From<IceCandidate> for SignalPayload {
    fn from(candidate: IceCandidate) -> Self {
        SignalPayload::Candidate {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(flatten)]
    pub payload: SignalPayload,
    pub from: SessionKey,
    pub sent_at_millis: u64,
}

impl SignalMessage {
    pub fn new(from: SessionKey, payload: SignalPayload) -> Self {
        Self {
            payload,
            from,
            sent_at_millis: now_millis(),
        }
    }
}

/// A message taken from the local inbox, with the id it was stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    pub id: String,
    pub message: SignalMessage,
}

pub struct SignalingChannel {
    transport: DualTransport,
    root: String,
    poll_interval: Duration,
    seq: AtomicU64,
}

impl SignalingChannel {
    pub fn new(transport: DualTransport, root: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            transport,
            root: root.into(),
            poll_interval,
            seq: AtomicU64::new(0),
        }
    }

    /// Fire-and-forget send: failures are logged and the message is dropped.
    pub async fn send(&self, room: &str, to: &SessionKey, message: SignalMessage) {
        let kind = message.payload.kind();
        if let Err(err) = self.try_send(room, to, message).await {
            warn!(target = "parley::signaling", %to, kind, error = %err, "dropping signal");
        }
    }

    /// Writes one message into `to`'s inbox and returns its id.
    pub async fn try_send(
        &self,
        room: &str,
        to: &SessionKey,
        message: SignalMessage,
    ) -> CallResult<String> {
        let id = self.next_id();
        let path = RoomPaths::new(&self.root, room)?.message(to, &id)?;
        let value = serde_json::to_value(&message).map_err(|err| CallError::SignalDelivery {
            to: to.clone(),
            reason: err.to_string(),
        })?;
        let route = self
            .transport
            .write(&path, value)
            .await
            .map_err(|err| CallError::SignalDelivery {
                to: to.clone(),
                reason: err.to_string(),
            })?;
        trace!(target = "parley::signaling", %to, %id, kind = message.payload.kind(), ?route, "signal sent");
        Ok(id)
    }

    /// Starts consuming `me`'s inbox. Messages from `me` itself are skipped.
    pub async fn subscribe(&self, room: &str, me: &SessionKey) -> CallResult<SignalWatch> {
        let inbox = RoomPaths::new(&self.root, room)?.inbox(me)?;
        let push = match self.transport.subscribe(&inbox).await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(target = "parley::signaling", %inbox, error = %err, "push delivery unavailable; polling only");
                None
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = InboxConsumer {
            transport: self.transport.clone(),
            inbox,
            me: me.clone(),
            seen: HashSet::new(),
            tx,
        };
        let task = tokio::spawn(consumer.run(push, self.poll_interval));
        Ok(SignalWatch { rx, task })
    }

    fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        let salt = Uuid::new_v4().simple().to_string();
        format!("{:013}-{seq:06}-{}", now_millis(), &salt[..8])
    }
}

/// Receiving end of an inbox subscription. Dropping it stops both the push
/// and the polling source.
pub struct SignalWatch {
    rx: mpsc::UnboundedReceiver<InboundSignal>,
    task: JoinHandle<()>,
}

impl SignalWatch {
    pub async fn next(&mut self) -> Option<InboundSignal> {
        self.rx.recv().await
    }

    pub fn stop(&mut self) {
        self.task.abort();
    }
}

impl Drop for SignalWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Source {
    Push(Option<Value>),
    Poll(Option<Value>),
}

struct InboxConsumer {
    transport: DualTransport,
    inbox: StorePath,
    me: SessionKey,
    seen: HashSet<String>,
    tx: mpsc::UnboundedSender<InboundSignal>,
}

impl InboxConsumer {
    async fn run(mut self, mut push: Option<StoreSubscription>, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let source = tokio::select! {
                event = StoreSubscription::recv_or_pending(&mut push) => match event {
                    Some(event) => Source::Push(event.value),
                    None => {
                        debug!(target = "parley::signaling", inbox = %self.inbox, "push source closed");
                        push = None;
                        continue;
                    }
                },
                _ = ticker.tick() => match self.transport.read(&self.inbox).await {
                    Ok(value) => Source::Poll(value),
                    Err(err) => {
                        debug!(target = "parley::signaling", inbox = %self.inbox, error = %err, "inbox poll failed");
                        continue;
                    }
                },
            };
            if !self.consume(source).await {
                break;
            }
        }
    }

    /// Returns `false` once nobody is listening anymore.
    async fn consume(&mut self, source: Source) -> bool {
        let (snapshot, polled) = match source {
            Source::Push(value) => (value, false),
            Source::Poll(value) => (value, true),
        };
        let Some(Value::Object(entries)) = snapshot else {
            return true;
        };
        // Ids sort by send time, so per-sender order is preserved.
        let entries: BTreeMap<String, Value> = entries.into_iter().collect();

        let mut consumed = Vec::new();
        for (id, value) in entries {
            if !self.seen.insert(id.clone()) {
                // A lingering copy of something already delivered.
                if polled {
                    consumed.push(id);
                }
                continue;
            }
            consumed.push(id.clone());
            let message = match serde_json::from_value::<SignalMessage>(value) {
                Ok(message) => message,
                Err(err) => {
                    warn!(target = "parley::signaling", %id, error = %err, "discarding malformed signal");
                    continue;
                }
            };
            if message.from == self.me {
                continue;
            }
            trace!(target = "parley::signaling", %id, from = %message.from, kind = message.payload.kind(), "signal received");
            if self.tx.send(InboundSignal { id, message }).is_err() {
                return false;
            }
        }

        for id in consumed {
            let path = match self.inbox.child(&id) {
                Ok(path) => path,
                Err(err) => {
                    warn!(target = "parley::signaling", %id, error = %err, "unaddressable signal id");
                    continue;
                }
            };
            if let Err(err) = self.transport.delete(&path).await {
                debug!(target = "parley::signaling", %id, error = %err, "failed to delete consumed signal");
            }
        }
        true
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
