//! One negotiation context per remote session.
//!
//! The manager enforces the offer/answer protocol around
//! [`Negotiation`] handles: only the session chosen by [`should_offer`]
//! creates an offer, answers are accepted only while an offer is
//! outstanding, and remote candidates that arrive before the remote
//! description are queued and applied once, in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CallError, CallResult};
use crate::media::{
    ConnectionState, IceCandidate, LocalAudio, MediaEngine, Negotiation, PeerEventSink,
    SessionDescription,
};
use crate::session_key::{should_offer, SessionKey};
use crate::signaling::{SignalMessage, SignalPayload, SignalingChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

struct PeerContext {
    handle: Arc<dyn Negotiation>,
    phase: NegotiationPhase,
    state: ConnectionState,
    remote_described: bool,
    pending: Vec<IceCandidate>,
}

impl PeerContext {
    fn new(handle: Arc<dyn Negotiation>) -> Self {
        Self {
            handle,
            phase: NegotiationPhase::New,
            state: ConnectionState::New,
            remote_described: false,
            pending: Vec::new(),
        }
    }

    async fn flush_pending(&mut self, peer: &SessionKey) {
        if self.pending.is_empty() {
            return;
        }
        let queued = std::mem::take(&mut self.pending);
        debug!(target = "parley::peers", %peer, count = queued.len(), "applying queued candidates");
        for candidate in queued {
            if let Err(err) = self.handle.add_ice_candidate(candidate).await {
                warn!(target = "parley::peers", %peer, error = %err, "queued candidate rejected");
            }
        }
    }
}

pub struct PeerConnectionManager {
    local: SessionKey,
    room: String,
    media: Arc<dyn MediaEngine>,
    signaling: Arc<SignalingChannel>,
    events: PeerEventSink,
    audio: Option<LocalAudio>,
    peers: HashMap<SessionKey, PeerContext>,
}

impl PeerConnectionManager {
    pub fn new(
        local: SessionKey,
        room: impl Into<String>,
        media: Arc<dyn MediaEngine>,
        signaling: Arc<SignalingChannel>,
        events: PeerEventSink,
    ) -> Self {
        Self {
            local,
            room: room.into(),
            media,
            signaling,
            events,
            audio: None,
            peers: HashMap::new(),
        }
    }

    pub fn local(&self) -> &SessionKey {
        &self.local
    }

    pub fn set_local_audio(&mut self, audio: LocalAudio) {
        self.audio = Some(audio);
    }

    pub fn local_audio(&self) -> Option<&LocalAudio> {
        self.audio.as_ref()
    }

    async fn ensure_audio(&mut self) -> CallResult<LocalAudio> {
        if let Some(audio) = &self.audio {
            return Ok(audio.clone());
        }
        let audio = self.media.capture_audio().await?;
        self.audio = Some(audio.clone());
        Ok(audio)
    }

    /// Creates the context for `remote` if it does not exist yet.
    pub async fn ensure_context(&mut self, remote: &SessionKey) -> CallResult<()> {
        if self.peers.contains_key(remote) {
            return Ok(());
        }
        if remote == &self.local {
            return Err(CallError::negotiation(remote, "refusing to negotiate with own session"));
        }
        let audio = self.ensure_audio().await?;
        let handle = self
            .media
            .create_context(remote, &audio, self.events.clone())
            .await?;
        debug!(target = "parley::peers", peer = %remote, "created negotiation context");
        self.peers.insert(remote.clone(), PeerContext::new(handle));
        Ok(())
    }

    /// Sends an offer to `remote` when this session is the designated
    /// offerer and no offer was delivered yet. Returns whether an offer went
    /// out. An offer that could not be delivered leaves the context in
    /// [`NegotiationPhase::New`] so a later call offers again.
    pub async fn create_offer(&mut self, remote: &SessionKey) -> CallResult<bool> {
        if !should_offer(&self.local, remote) {
            debug!(target = "parley::peers", peer = %remote, "remote side offers");
            return Ok(false);
        }
        self.ensure_context(remote).await?;
        let Some(ctx) = self.peers.get_mut(remote) else {
            return Ok(false);
        };
        if ctx.phase != NegotiationPhase::New {
            debug!(target = "parley::peers", peer = %remote, phase = ?ctx.phase, "offer already made");
            return Ok(false);
        }

        let offer = ctx.handle.create_offer().await?;
        ctx.handle.set_local_description(offer.clone()).await?;
        info!(target = "parley::peers", peer = %remote, "sending offer");
        let message = SignalMessage::new(self.local.clone(), SignalPayload::Offer { sdp: offer.sdp });
        if let Err(err) = self.signaling.try_send(&self.room, remote, message).await {
            warn!(target = "parley::peers", peer = %remote, error = %err, "offer not delivered");
            return Err(err);
        }
        ctx.phase = NegotiationPhase::HaveLocalOffer;
        Ok(true)
    }

    /// Applies a remote offer, flushes queued candidates and answers. A
    /// context whose answer cannot be produced is closed and forgotten.
    pub async fn accept_offer(&mut self, remote: &SessionKey, sdp: String) -> CallResult<()> {
        self.ensure_context(remote).await?;
        let Some(ctx) = self.peers.get_mut(remote) else {
            return Ok(());
        };
        match ctx.phase {
            NegotiationPhase::New => {}
            NegotiationPhase::HaveLocalOffer => {
                warn!(target = "parley::peers", peer = %remote, "ignoring offer while our own offer is outstanding");
                return Ok(());
            }
            phase => {
                warn!(target = "parley::peers", peer = %remote, ?phase, "ignoring repeated offer");
                return Ok(());
            }
        }

        ctx.handle
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        ctx.remote_described = true;
        ctx.phase = NegotiationPhase::HaveRemoteOffer;
        ctx.flush_pending(remote).await;

        let handle = Arc::clone(&ctx.handle);
        let answer = match produce_answer(&*handle).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(target = "parley::peers", peer = %remote, error = %err, "answer failed; dropping context");
                self.close_peer(remote).await;
                return Err(err);
            }
        };
        if let Some(ctx) = self.peers.get_mut(remote) {
            ctx.phase = NegotiationPhase::Stable;
        }
        info!(target = "parley::peers", peer = %remote, "sending answer");
        self.signaling
            .send(
                &self.room,
                remote,
                SignalMessage::new(self.local.clone(), SignalPayload::Answer { sdp: answer.sdp }),
            )
            .await;
        Ok(())
    }

    /// Applies an answer to our outstanding offer; anything else is ignored.
    pub async fn accept_answer(&mut self, remote: &SessionKey, sdp: String) -> CallResult<()> {
        let Some(ctx) = self.peers.get_mut(remote) else {
            warn!(target = "parley::peers", peer = %remote, "answer from unknown peer");
            return Ok(());
        };
        if ctx.phase != NegotiationPhase::HaveLocalOffer {
            warn!(target = "parley::peers", peer = %remote, phase = ?ctx.phase, "ignoring unexpected answer");
            return Ok(());
        }
        ctx.handle
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        ctx.remote_described = true;
        ctx.phase = NegotiationPhase::Stable;
        debug!(target = "parley::peers", peer = %remote, "answer applied");
        ctx.flush_pending(remote).await;
        Ok(())
    }

    /// Applies a remote candidate, or queues it until the remote description
    /// is known.
    pub async fn add_candidate(
        &mut self,
        remote: &SessionKey,
        candidate: IceCandidate,
    ) -> CallResult<()> {
        self.ensure_context(remote).await?;
        let Some(ctx) = self.peers.get_mut(remote) else {
            return Ok(());
        };
        if ctx.remote_described {
            ctx.handle.add_ice_candidate(candidate).await
        } else {
            ctx.pending.push(candidate);
            debug!(target = "parley::peers", peer = %remote, queued = ctx.pending.len(), "candidate queued");
            Ok(())
        }
    }

    /// Records a connection state reported by the media layer. Returns the
    /// transition when it was accepted.
    pub fn on_connection_state(
        &mut self,
        remote: &SessionKey,
        state: ConnectionState,
    ) -> Option<StateTransition> {
        let Some(ctx) = self.peers.get_mut(remote) else {
            debug!(target = "parley::peers", peer = %remote, ?state, "state for closed peer");
            return None;
        };
        if ctx.state == state {
            return None;
        }
        if !ctx.state.can_transition_to(state) {
            warn!(target = "parley::peers", peer = %remote, from = ?ctx.state, to = ?state, "rejected connection state transition");
            return None;
        }
        let transition = StateTransition {
            from: ctx.state,
            to: state,
        };
        ctx.state = state;
        info!(target = "parley::peers", peer = %remote, ?state, "connection state");
        Some(transition)
    }

    /// Closes and forgets the context for `remote`.
    pub async fn close_peer(&mut self, remote: &SessionKey) -> bool {
        let Some(ctx) = self.peers.remove(remote) else {
            return false;
        };
        ctx.handle.close().await;
        debug!(target = "parley::peers", peer = %remote, "context closed");
        true
    }

    /// Closes every context. Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        for (peer, ctx) in self.peers.drain() {
            ctx.handle.close().await;
            debug!(target = "parley::peers", %peer, "context closed");
        }
    }

    pub fn contains(&self, remote: &SessionKey) -> bool {
        self.peers.contains_key(remote)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn state(&self, remote: &SessionKey) -> Option<ConnectionState> {
        self.peers.get(remote).map(|ctx| ctx.state)
    }

    pub fn phase(&self, remote: &SessionKey) -> Option<NegotiationPhase> {
        self.peers.get(remote).map(|ctx| ctx.phase)
    }

    pub fn pending_candidates(&self, remote: &SessionKey) -> usize {
        self.peers.get(remote).map_or(0, |ctx| ctx.pending.len())
    }
}

async fn produce_answer(handle: &dyn Negotiation) -> CallResult<SessionDescription> {
    let answer = handle.create_answer().await?;
    handle.set_local_description(answer.clone()).await?;
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fake_media::FakeMedia;
    use crate::transport::DualTransport;
    use parley_store::MemoryStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn manager(local: &str, media: &Arc<FakeMedia>) -> (PeerConnectionManager, MemoryStore) {
        let store = MemoryStore::new();
        let transport = DualTransport::new(Arc::new(store.connect()), None, Duration::from_millis(100));
        let signaling = Arc::new(SignalingChannel::new(transport, "calls", Duration::from_secs(1)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let media: Arc<dyn MediaEngine> = media.clone();
        (
            PeerConnectionManager::new(SessionKey::new(local), "r1", media, signaling, tx),
            store,
        )
    }

    #[tokio::test]
    async fn only_the_greater_key_offers_and_only_once() {
        let media = Arc::new(FakeMedia::new());
        let (mut user2, _store) = manager("user2_xyz", &media);
        let user1 = SessionKey::new("user1_abc");
        assert!(user2.create_offer(&user1).await.unwrap());
        assert!(!user2.create_offer(&user1).await.unwrap());
        assert_eq!(user2.phase(&user1), Some(NegotiationPhase::HaveLocalOffer));
        assert_eq!(media.context(&user1).unwrap().offers_created(), 1);

        let other = Arc::new(FakeMedia::new());
        let (mut user1_mgr, _store) = manager("user1_abc", &other);
        assert!(!user1_mgr.create_offer(&SessionKey::new("user2_xyz")).await.unwrap());
        assert!(user1_mgr.is_empty());
    }

    #[tokio::test]
    async fn candidates_before_offer_are_applied_once_in_order() {
        let media = Arc::new(FakeMedia::new());
        let (mut mgr, _store) = manager("user1_abc", &media);
        let remote = SessionKey::new("user2_xyz");

        for n in 1..=3 {
            mgr.add_candidate(&remote, candidate(n)).await.unwrap();
        }
        assert_eq!(mgr.pending_candidates(&remote), 3);
        assert!(media.context(&remote).unwrap().applied_candidates().is_empty());

        mgr.accept_offer(&remote, "v=0 offer".into()).await.unwrap();
        assert_eq!(mgr.pending_candidates(&remote), 0);
        assert_eq!(mgr.phase(&remote), Some(NegotiationPhase::Stable));

        mgr.add_candidate(&remote, candidate(4)).await.unwrap();
        let applied: Vec<String> = media
            .context(&remote)
            .unwrap()
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(
            applied,
            vec!["candidate:1", "candidate:2", "candidate:3", "candidate:4"]
        );
    }

    #[tokio::test]
    async fn answer_flushes_queue_and_unexpected_answers_are_ignored() {
        let media = Arc::new(FakeMedia::new());
        let (mut mgr, _store) = manager("user2_xyz", &media);
        let remote = SessionKey::new("user1_abc");

        // No context yet: ignored without creating one.
        mgr.accept_answer(&remote, "v=0 early".into()).await.unwrap();
        assert!(!mgr.contains(&remote));

        mgr.create_offer(&remote).await.unwrap();
        mgr.add_candidate(&remote, candidate(1)).await.unwrap();
        assert_eq!(mgr.pending_candidates(&remote), 1);

        mgr.accept_answer(&remote, "v=0 answer".into()).await.unwrap();
        let ctx = media.context(&remote).unwrap();
        assert_eq!(ctx.applied_candidates().len(), 1);
        assert_eq!(ctx.remote_description().unwrap().sdp, "v=0 answer");

        mgr.accept_answer(&remote, "v=0 again".into()).await.unwrap();
        assert_eq!(ctx.remote_description().unwrap().sdp, "v=0 answer");
    }

    #[tokio::test]
    async fn failed_answer_still_applies_queued_candidates_first() {
        let media = Arc::new(FakeMedia::new());
        let (mut mgr, _store) = manager("user1_abc", &media);
        let remote = SessionKey::new("user2_xyz");

        mgr.add_candidate(&remote, candidate(1)).await.unwrap();
        media.fail_answers(true);
        let err = mgr.accept_offer(&remote, "v=0 offer".into()).await.unwrap_err();
        assert!(matches!(err, CallError::Media(_)));

        let failed = media.context(&remote).unwrap();
        let applied: Vec<String> = failed
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:1"]);
        assert!(failed.is_closed());
        assert!(!mgr.contains(&remote));
        assert_eq!(mgr.pending_candidates(&remote), 0);

        // A later offer starts over on a fresh context.
        media.fail_answers(false);
        mgr.add_candidate(&remote, candidate(2)).await.unwrap();
        mgr.accept_offer(&remote, "v=0 offer again".into()).await.unwrap();
        assert_eq!(mgr.phase(&remote), Some(NegotiationPhase::Stable));
        let fresh = media.context(&remote).unwrap();
        assert_eq!(fresh.answers_created(), 1);
        assert_eq!(fresh.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn undelivered_offer_is_made_again() {
        let media = Arc::new(FakeMedia::new());
        let store = MemoryStore::new();
        let conn = store.connect();
        let transport = DualTransport::new(Arc::new(conn.clone()), None, Duration::from_millis(100));
        let signaling = Arc::new(SignalingChannel::new(transport, "calls", Duration::from_secs(1)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine: Arc<dyn MediaEngine> = media.clone();
        let mut mgr =
            PeerConnectionManager::new(SessionKey::new("user2_xyz"), "r1", engine, signaling, tx);
        let remote = SessionKey::new("user1_abc");

        conn.set_offline(true);
        let err = mgr.create_offer(&remote).await.unwrap_err();
        assert!(matches!(err, CallError::SignalDelivery { .. }));
        assert_eq!(mgr.phase(&remote), Some(NegotiationPhase::New));

        conn.set_offline(false);
        assert!(mgr.create_offer(&remote).await.unwrap());
        assert_eq!(mgr.phase(&remote), Some(NegotiationPhase::HaveLocalOffer));
        assert!(!mgr.create_offer(&remote).await.unwrap());
        assert_eq!(media.context(&remote).unwrap().offers_created(), 2);

        let inbox = crate::paths::RoomPaths::new("calls", "r1")
            .unwrap()
            .inbox(&remote)
            .unwrap();
        let delivered = store.snapshot(&inbox).unwrap();
        assert_eq!(delivered.as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn offer_is_ignored_while_own_offer_outstanding() {
        let media = Arc::new(FakeMedia::new());
        let (mut mgr, _store) = manager("user2_xyz", &media);
        let remote = SessionKey::new("user1_abc");
        mgr.create_offer(&remote).await.unwrap();
        mgr.accept_offer(&remote, "v=0 glare".into()).await.unwrap();
        assert_eq!(mgr.phase(&remote), Some(NegotiationPhase::HaveLocalOffer));
        assert_eq!(media.context(&remote).unwrap().answers_created(), 0);
    }

    #[tokio::test]
    async fn state_transitions_follow_the_table() {
        let media = Arc::new(FakeMedia::new());
        let (mut mgr, _store) = manager("user2_xyz", &media);
        let remote = SessionKey::new("user1_abc");
        mgr.ensure_context(&remote).await.unwrap();

        assert!(mgr.on_connection_state(&remote, ConnectionState::Connecting).is_some());
        assert!(mgr.on_connection_state(&remote, ConnectionState::Connecting).is_none());
        let transition = mgr
            .on_connection_state(&remote, ConnectionState::Connected)
            .unwrap();
        assert_eq!(transition.from, ConnectionState::Connecting);
        assert!(mgr.on_connection_state(&remote, ConnectionState::New).is_none());
        assert_eq!(mgr.state(&remote), Some(ConnectionState::Connected));

        assert!(mgr.on_connection_state(&remote, ConnectionState::Closed).is_some());
        assert!(mgr.on_connection_state(&remote, ConnectionState::Connected).is_none());
        assert!(mgr
            .on_connection_state(&SessionKey::new("nobody_1"), ConnectionState::Connected)
            .is_none());
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_closes_contexts() {
        let media = Arc::new(FakeMedia::new());
        let (mut mgr, _store) = manager("user2_xyz", &media);
        let a = SessionKey::new("user1_abc");
        let b = SessionKey::new("user0_def");
        mgr.create_offer(&a).await.unwrap();
        mgr.create_offer(&b).await.unwrap();
        assert_eq!(mgr.len(), 2);

        assert!(mgr.close_peer(&a).await);
        assert!(!mgr.close_peer(&a).await);
        assert!(media.context(&a).unwrap().is_closed());

        mgr.teardown().await;
        mgr.teardown().await;
        assert!(mgr.is_empty());
        assert!(media.context(&b).unwrap().is_closed());
    }

    #[tokio::test]
    async fn refuses_own_session() {
        let media = Arc::new(FakeMedia::new());
        let (mut mgr, _store) = manager("user1_abc", &media);
        let err = mgr
            .ensure_context(&SessionKey::new("user1_abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Negotiation { .. }));
    }

    #[tokio::test]
    async fn lazily_captures_audio_once() {
        let media = Arc::new(FakeMedia::new());
        let (mut mgr, _store) = manager("user1_abc", &media);
        assert!(mgr.local_audio().is_none());
        mgr.add_candidate(&SessionKey::new("user2_xyz"), candidate(1))
            .await
            .unwrap();
        mgr.add_candidate(&SessionKey::new("user3_xyz"), candidate(1))
            .await
            .unwrap();
        assert!(mgr.local_audio().is_some());
        assert_eq!(media.captures().len(), 1);
    }
}
