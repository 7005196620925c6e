//! Call lifecycle: `Idle -> Joining -> InCall -> Ending -> Idle`.
//!
//! [`CallController`] owns at most one active call. Roster snapshots, inbound
//! signals and media events are consumed by a single event loop task per
//! call, which is the only place the peer connection manager is driven from
//! once the call is up. Ending a call is idempotent and always releases the
//! microphone, closes every negotiation context and removes the roster entry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use parley_store::RealtimeStore;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::error::{CallError, CallResult};
use crate::media::{ConnectionState, IceCandidate, LocalAudio, MediaEngine, MediaEvent, PeerEvent};
use crate::paths::RoomPaths;
use crate::peers::{NegotiationPhase, PeerConnectionManager};
use crate::registry::{Participant, Roster, RosterWatch, SessionRegistry};
use crate::session_key::{should_offer, SessionKey};
use crate::signaling::{
    now_millis, InboundSignal, SignalMessage, SignalPayload, SignalWatch, SignalingChannel,
};
use crate::transport::DualTransport;

const NOTIFICATION_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Joining,
    InCall,
    Ending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    /// Everyone else left the roster.
    RemoteLeft,
    ConnectionLost,
    ConnectionFailed,
    /// The process received ctrl-c while in the call.
    Interrupted,
}

/// Events for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotification {
    StateChanged(CallState),
    PeerStateChanged {
        peer: SessionKey,
        state: ConnectionState,
    },
    RosterChanged(Roster),
    /// First connection of the call; fires once per call.
    Connected { peer: SessionKey },
    Ended { duration_secs: u64, reason: EndReason },
    Status(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub room: String,
    pub session_key: SessionKey,
    pub participant: Participant,
    pub started_at_millis: Option<u64>,
    pub duration_secs: u64,
    pub reason: EndReason,
    pub peers: Vec<SessionKey>,
}

/// Receives a record of every call that reached `InCall`.
#[async_trait]
pub trait CallHistorySink: Send + Sync {
    async fn record(&self, record: CallRecord);
}

pub struct NoHistory;

#[async_trait]
impl CallHistorySink for NoHistory {
    async fn record(&self, _record: CallRecord) {}
}

enum CallEvent {
    Roster(Roster),
    Signal(InboundSignal),
    Peer(PeerEvent),
    Interrupted(SessionKey),
    RetryOffers,
}

struct ActiveCall {
    generation: u64,
    room: String,
    local: SessionKey,
    participant: Participant,
    peers: PeerConnectionManager,
    /// Peers present in the last roster snapshot.
    known: HashSet<SessionKey>,
    departed: HashSet<SessionKey>,
    connected: HashSet<SessionKey>,
    self_seen: bool,
    started: Option<(Instant, u64)>,
    shutdown: watch::Sender<bool>,
    event_loop: Option<JoinHandle<()>>,
}

/// What the synchronous accessors need while a call is up.
#[derive(Clone)]
struct Current {
    room: String,
    local: SessionKey,
    audio: LocalAudio,
}

struct Shared {
    config: CallConfig,
    registry: SessionRegistry,
    signaling: Arc<SignalingChannel>,
    media: Arc<dyn MediaEngine>,
    history: Arc<dyn CallHistorySink>,
    state: Mutex<CallState>,
    generation: AtomicU64,
    muted: AtomicBool,
    current: Mutex<Option<Current>>,
    echo: Mutex<Option<LocalAudio>>,
    active: tokio::sync::Mutex<Option<ActiveCall>>,
    /// Held for the whole of a call's teardown.
    closing: tokio::sync::Mutex<()>,
    notifications: broadcast::Sender<CallNotification>,
}

#[derive(Clone)]
pub struct CallController {
    shared: Arc<Shared>,
}

impl CallController {
    pub fn new(
        config: CallConfig,
        transport: DualTransport,
        media: Arc<dyn MediaEngine>,
        history: Arc<dyn CallHistorySink>,
    ) -> Self {
        let registry = SessionRegistry::new(
            transport.clone(),
            config.root.clone(),
            config.roster_poll_interval,
            config.install_exit_hook,
        );
        let signaling = Arc::new(SignalingChannel::new(
            transport,
            config.root.clone(),
            config.signal_poll_interval,
        ));
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                signaling,
                media,
                history,
                state: Mutex::new(CallState::Idle),
                generation: AtomicU64::new(0),
                muted: AtomicBool::new(false),
                current: Mutex::new(None),
                echo: Mutex::new(None),
                active: tokio::sync::Mutex::new(None),
                closing: tokio::sync::Mutex::new(()),
                notifications,
            }),
        }
    }

    /// Builds a controller over `primary`, with the REST fallback when the
    /// configuration names a store URL.
    pub fn connect(
        config: CallConfig,
        primary: Arc<dyn RealtimeStore>,
        media: Arc<dyn MediaEngine>,
        history: Arc<dyn CallHistorySink>,
    ) -> CallResult<Self> {
        let fallback = config
            .http_fallback()?
            .map(|http| Arc::new(http) as Arc<dyn parley_store::FallbackTransport>);
        let transport = DualTransport::new(primary, fallback, config.primary_timeout);
        Ok(Self::new(config, transport, media, history))
    }

    pub fn state(&self) -> CallState {
        *self.shared.state.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.shared.notifications.subscribe()
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.shared.current.lock().as_ref().map(|c| c.local.clone())
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::SeqCst)
    }

    /// Number of live negotiation contexts.
    pub async fn peer_count(&self) -> usize {
        self.shared
            .active
            .lock()
            .await
            .as_ref()
            .map_or(0, |call| call.peers.len())
    }

    /// Joins `room`: captures audio, registers in the roster and negotiates
    /// with every session already present. Returns the new session key.
    pub async fn start_call(&self, room: &str, participant: Participant) -> CallResult<SessionKey> {
        let local = SessionKey::generate(&participant.user_id, &self.shared.config.key_separator);
        // Rejects room names and user ids that cannot be store path segments.
        RoomPaths::new(&self.shared.config.root, room)?.session(&local)?;

        let generation = {
            let mut state = self.shared.state.lock();
            if *state != CallState::Idle {
                return Err(CallError::AlreadyActive);
            }
            *state = CallState::Joining;
            self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.shared.notify(CallNotification::StateChanged(CallState::Joining));
        info!(target = "parley::call", %room, user = %participant.user_id, "starting call");

        let audio = match self.shared.media.capture_audio().await {
            Ok(audio) => audio,
            Err(err) => {
                warn!(target = "parley::call", error = %err, "could not open microphone");
                self.shared.reset_if_current(generation);
                self.shared.notify(CallNotification::Status(err.to_string()));
                return Err(err);
            }
        };

        let mut active = self.shared.active.lock().await;
        if self.shared.generation.load(Ordering::SeqCst) != generation {
            audio.stop();
            info!(target = "parley::call", %room, "call ended while opening microphone");
            return Err(CallError::Cancelled);
        }
        audio.set_enabled(!self.is_muted());

        let watches = async {
            let signals = self.shared.signaling.subscribe(room, &local).await?;
            let roster = self.shared.registry.subscribe(room).await?;
            Ok::<_, CallError>((signals, roster))
        }
        .await;
        let (signals, roster) = match watches {
            Ok(watches) => watches,
            Err(err) => {
                audio.stop();
                self.shared.reset_if_current(generation);
                return Err(err);
            }
        };

        let interrupts = self.shared.registry.interrupts();
        if let Err(err) = self.shared.registry.join(room, &local, &participant).await {
            // The roster write may land later through the realtime store.
            warn!(target = "parley::call", error = %err, "roster registration failed; continuing");
        }

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let mut peers = PeerConnectionManager::new(
            local.clone(),
            room,
            Arc::clone(&self.shared.media),
            Arc::clone(&self.shared.signaling),
            peer_tx,
        );
        peers.set_local_audio(audio.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let event_loop = tokio::spawn(Arc::clone(&self.shared).run(
            generation,
            roster,
            signals,
            peer_rx,
            interrupts,
            shutdown_rx,
        ));

        *active = Some(ActiveCall {
            generation,
            room: room.to_string(),
            local: local.clone(),
            participant,
            peers,
            known: HashSet::new(),
            departed: HashSet::new(),
            connected: HashSet::new(),
            self_seen: false,
            started: None,
            shutdown,
            event_loop: Some(event_loop),
        });
        *self.shared.current.lock() = Some(Current {
            room: room.to_string(),
            local: local.clone(),
            audio,
        });
        self.shared.set_state(CallState::InCall);
        drop(active);
        info!(target = "parley::call", %room, session = %local, "in call");
        Ok(local)
    }

    /// Ends the current call, or cancels one that is still opening the
    /// microphone. Returns the connected duration in seconds; 0 when there
    /// was nothing to end. A call already ending on its own is awaited.
    pub async fn end_call(&self) -> u64 {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(echo) = self.shared.echo.lock().take() {
            echo.stop();
        }
        let _closing = self.shared.closing.lock().await;
        let call = self.shared.active.lock().await.take();
        let Some(mut call) = call else {
            self.shared.set_state(CallState::Idle);
            return 0;
        };
        if let Some(event_loop) = call.event_loop.take() {
            event_loop.abort();
        }
        self.shared.close_call(call, EndReason::Hangup).await
    }

    /// Flips the microphone mute flag and returns the new value.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.shared.muted.fetch_xor(true, Ordering::SeqCst);
        if let Some(current) = self.shared.current.lock().as_ref() {
            current.audio.set_enabled(!muted);
        }
        debug!(target = "parley::call", muted, "microphone mute toggled");
        self.shared.notify(CallNotification::Status(
            if muted { "microphone muted" } else { "microphone live" }.to_string(),
        ));
        muted
    }

    /// Removes every other roster entry in the current room.
    pub async fn clear_ghost_sessions(&self) -> CallResult<usize> {
        let Some(current) = self.shared.current.lock().clone() else {
            return Err(CallError::NotInCall);
        };
        let removed = self
            .shared
            .registry
            .purge_others(&current.room, &current.local)
            .await?;
        self.shared.notify(CallNotification::Status(format!(
            "removed {removed} stale session(s)"
        )));
        Ok(removed)
    }

    /// Loops the microphone back to local playback. Outside a call this
    /// opens the microphone on its own and releases it when disabled.
    pub async fn test_echo(&self, enable: bool) -> CallResult<()> {
        if let Some(current) = self.shared.current.lock().as_ref() {
            current.audio.set_loopback(enable);
            return Ok(());
        }
        if !enable {
            if let Some(echo) = self.shared.echo.lock().take() {
                echo.stop();
            }
            return Ok(());
        }
        if self.shared.echo.lock().is_some() {
            return Ok(());
        }
        let audio = self.shared.media.capture_audio().await?;
        audio.set_loopback(true);
        if let Some(previous) = self.shared.echo.lock().replace(audio) {
            previous.stop();
        }
        Ok(())
    }

    /// Frames to play locally while echo testing.
    pub fn playback(&self) -> Option<broadcast::Receiver<Bytes>> {
        if let Some(current) = self.shared.current.lock().as_ref() {
            return Some(current.audio.playback());
        }
        self.shared.echo.lock().as_ref().map(|echo| echo.playback())
    }
}

impl Shared {
    fn notify(&self, notification: CallNotification) {
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }

    fn set_state(&self, next: CallState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            self.notify(CallNotification::StateChanged(next));
        }
    }

    /// Returns to `Idle` unless another start or end has happened since.
    fn reset_if_current(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.set_state(CallState::Idle);
        }
    }

    async fn run(
        self: Arc<Self>,
        generation: u64,
        mut roster: RosterWatch,
        mut signals: SignalWatch,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        mut interrupts: broadcast::Receiver<SessionKey>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut retry = tokio::time::interval(self.config.roster_poll_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                Some(snapshot) = roster.next() => CallEvent::Roster(snapshot),
                Some(signal) = signals.next() => CallEvent::Signal(signal),
                Some(event) = peer_events.recv() => CallEvent::Peer(event),
                Ok(key) = interrupts.recv() => CallEvent::Interrupted(key),
                _ = retry.tick() => CallEvent::RetryOffers,
            };
            if let Some(reason) = self.handle(generation, event).await {
                self.finish(generation, reason).await;
                break;
            }
        }
        debug!(target = "parley::call", generation, "event loop stopped");
    }

    async fn handle(&self, generation: u64, event: CallEvent) -> Option<EndReason> {
        let mut active = self.active.lock().await;
        let call = active.as_mut().filter(|call| call.generation == generation)?;
        match event {
            CallEvent::Roster(roster) => self.on_roster(call, roster).await,
            CallEvent::Signal(signal) => {
                self.on_signal(call, signal).await;
                None
            }
            CallEvent::Peer(event) => self.on_peer_event(call, event).await,
            CallEvent::Interrupted(key) => {
                (key == call.local).then_some(EndReason::Interrupted)
            }
            CallEvent::RetryOffers => {
                self.offer_pending(call).await;
                None
            }
        }
    }

    async fn on_roster(&self, call: &mut ActiveCall, roster: Roster) -> Option<EndReason> {
        if roster.contains(&call.local) {
            call.self_seen = true;
        } else if call.self_seen {
            warn!(target = "parley::call", session = %call.local, "own roster entry vanished; re-registering");
            call.self_seen = false;
            if let Err(err) = self
                .registry
                .join(&call.room, &call.local, &call.participant)
                .await
            {
                warn!(target = "parley::call", error = %err, "re-registration failed");
            }
        }

        let present: HashSet<SessionKey> = roster
            .others(&call.local)
            .map(|entry| entry.session_key.clone())
            .collect();

        let departed: Vec<SessionKey> = call.known.difference(&present).cloned().collect();
        for peer in departed {
            info!(target = "parley::call", %peer, "peer left the room");
            call.peers.close_peer(&peer).await;
            call.departed.insert(peer);
        }

        let mut arrived: Vec<SessionKey> = present.difference(&call.known).cloned().collect();
        arrived.sort();
        for peer in arrived {
            call.departed.remove(&peer);
            if !should_offer(&call.local, &peer) {
                debug!(target = "parley::call", %peer, "waiting for offer");
            }
        }

        call.known = present;
        self.offer_pending(call).await;
        self.notify(CallNotification::RosterChanged(roster));

        if call.known.is_empty() && !call.connected.is_empty() {
            info!(target = "parley::call", room = %call.room, "last peer left");
            return Some(EndReason::RemoteLeft);
        }
        None
    }

    /// Offers to every known peer this session offers to whose offer has not
    /// gone out yet, including offers that failed to deliver earlier.
    async fn offer_pending(&self, call: &mut ActiveCall) {
        let mut pending: Vec<SessionKey> = call
            .known
            .iter()
            .filter(|peer| should_offer(&call.local, peer))
            .filter(|peer| {
                call.peers
                    .phase(peer)
                    .map_or(true, |phase| phase == NegotiationPhase::New)
            })
            .cloned()
            .collect();
        pending.sort();
        for peer in pending {
            if let Err(err) = call.peers.create_offer(&peer).await {
                warn!(target = "parley::call", %peer, error = %err, "failed to offer; retrying");
            }
        }
    }

    async fn on_signal(&self, call: &mut ActiveCall, signal: InboundSignal) {
        let InboundSignal { id, message } = signal;
        let from = message.from;
        if call.departed.contains(&from) {
            debug!(target = "parley::call", %from, %id, "dropping signal from departed peer");
            return;
        }
        let result = match message.payload {
            SignalPayload::Offer { sdp } => call.peers.accept_offer(&from, sdp).await,
            SignalPayload::Answer { sdp } => call.peers.accept_answer(&from, sdp).await,
            SignalPayload::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                call.peers
                    .add_candidate(
                        &from,
                        IceCandidate {
                            candidate,
                            sdp_mid,
                            sdp_mline_index,
                        },
                    )
                    .await
            }
        };
        if let Err(err) = result {
            warn!(target = "parley::call", %from, %id, error = %err, "signal not applied");
        }
    }

    async fn on_peer_event(&self, call: &mut ActiveCall, event: PeerEvent) -> Option<EndReason> {
        let PeerEvent { peer, event } = event;
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                if !call.peers.contains(&peer) {
                    debug!(target = "parley::call", %peer, "dropping candidate for closed peer");
                    return None;
                }
                self.signaling
                    .send(
                        &call.room,
                        &peer,
                        SignalMessage::new(call.local.clone(), candidate.into()),
                    )
                    .await;
                None
            }
            MediaEvent::StateChanged(state) => {
                call.peers.on_connection_state(&peer, state)?;
                self.notify(CallNotification::PeerStateChanged {
                    peer: peer.clone(),
                    state,
                });
                match state {
                    ConnectionState::Connected => {
                        call.connected.insert(peer.clone());
                        if call.started.is_none() {
                            call.started = Some((Instant::now(), now_millis()));
                            info!(target = "parley::call", %peer, "call connected");
                            self.notify(CallNotification::Connected { peer });
                        }
                        None
                    }
                    ConnectionState::Disconnected => Some(EndReason::ConnectionLost),
                    ConnectionState::Failed => Some(EndReason::ConnectionFailed),
                    _ => None,
                }
            }
            MediaEvent::RemoteAudio => {
                debug!(target = "parley::call", %peer, "receiving remote audio");
                None
            }
        }
    }

    /// Ends the call from inside its own event loop.
    async fn finish(&self, generation: u64, reason: EndReason) {
        let _closing = self.closing.lock().await;
        let call = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(call) if call.generation == generation => active.take(),
                _ => None,
            }
        };
        let Some(mut call) = call else {
            return;
        };
        // The loop is the caller; it exits on its own.
        call.event_loop.take();
        self.close_call(call, reason).await;
    }

    async fn close_call(&self, mut call: ActiveCall, reason: EndReason) -> u64 {
        self.set_state(CallState::Ending);
        let _ = call.shutdown.send(true);

        if let Some(current) = self.current.lock().take() {
            current.audio.stop();
        }
        if let Some(audio) = call.peers.local_audio() {
            audio.stop();
        }
        call.peers.teardown().await;

        if let Err(err) = self.registry.leave(&call.room, &call.local).await {
            warn!(target = "parley::call", error = %err, "failed to leave roster");
        }

        let duration_secs = call
            .started
            .map_or(0, |(started, _)| started.elapsed().as_secs());
        if call.started.is_some() {
            let mut peers: Vec<SessionKey> = call.connected.iter().cloned().collect();
            peers.sort();
            self.history
                .record(CallRecord {
                    room: call.room.clone(),
                    session_key: call.local.clone(),
                    participant: call.participant.clone(),
                    started_at_millis: call.started.map(|(_, millis)| millis),
                    duration_secs,
                    reason,
                    peers,
                })
                .await;
        }

        info!(target = "parley::call", room = %call.room, ?reason, duration_secs, "call ended");
        self.set_state(CallState::Idle);
        self.notify(CallNotification::Ended {
            duration_secs,
            reason,
        });
        duration_secs
    }
}
