use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CallError, CallResult};
use crate::media::{
    ConnectionState, IceCandidate, LocalAudio, MediaEngine, MediaEvent, Negotiation, PeerEvent,
    PeerEventSink, SdpKind, SessionDescription,
};
use crate::session_key::SessionKey;

/// Scripted media engine. A context reports one local candidate when its
/// local description is set and walks to `Connected` once both
/// descriptions are known.
pub(crate) struct FakeMedia {
    deny: AtomicBool,
    fail_answers: Arc<AtomicBool>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    captures: Mutex<Vec<LocalAudio>>,
    contexts: Mutex<HashMap<SessionKey, Arc<FakeNegotiation>>>,
}

impl FakeMedia {
    pub(crate) fn new() -> Self {
        Self {
            deny: AtomicBool::new(false),
            fail_answers: Arc::new(AtomicBool::new(false)),
            gate: Mutex::new(None),
            captures: Mutex::new(Vec::new()),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn deny_access(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    /// Makes every context's `create_answer` fail while `fail` is set.
    pub(crate) fn fail_answers(&self, fail: bool) {
        self.fail_answers.store(fail, Ordering::SeqCst);
    }

    /// Holds the next capture until the returned sender fires or is dropped.
    pub(crate) fn gate_capture(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    pub(crate) fn captures(&self) -> Vec<LocalAudio> {
        self.captures.lock().clone()
    }

    /// Most recent context created for `peer`.
    pub(crate) fn context(&self, peer: &SessionKey) -> Option<Arc<FakeNegotiation>> {
        self.contexts.lock().get(peer).cloned()
    }

    pub(crate) fn total_offers(&self) -> usize {
        self.contexts
            .lock()
            .values()
            .map(|ctx| ctx.offers_created())
            .sum()
    }

    pub(crate) fn total_answers(&self) -> usize {
        self.contexts
            .lock()
            .values()
            .map(|ctx| ctx.answers_created())
            .sum()
    }
}

#[async_trait]
impl MediaEngine for FakeMedia {
    async fn capture_audio(&self) -> CallResult<LocalAudio> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(CallError::MediaAccess("permission denied".into()));
        }
        let audio = LocalAudio::detached("fake-mic");
        self.captures.lock().push(audio.clone());
        Ok(audio)
    }

    async fn create_context(
        &self,
        peer: &SessionKey,
        _audio: &LocalAudio,
        events: PeerEventSink,
    ) -> CallResult<Arc<dyn Negotiation>> {
        let ctx = Arc::new(FakeNegotiation {
            peer: peer.clone(),
            events,
            fail_answers: Arc::clone(&self.fail_answers),
            inner: Mutex::new(FakeInner::default()),
        });
        self.contexts.lock().insert(peer.clone(), Arc::clone(&ctx));
        Ok(ctx)
    }
}

#[derive(Default)]
struct FakeInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    offers: usize,
    answers: usize,
    connected: bool,
    closed: bool,
}

pub(crate) struct FakeNegotiation {
    peer: SessionKey,
    events: PeerEventSink,
    fail_answers: Arc<AtomicBool>,
    inner: Mutex<FakeInner>,
}

impl FakeNegotiation {
    pub(crate) fn offers_created(&self) -> usize {
        self.inner.lock().offers
    }

    pub(crate) fn answers_created(&self) -> usize {
        self.inner.lock().answers
    }

    pub(crate) fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().applied.clone()
    }

    pub(crate) fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Reports `state` as if the media stack had observed it.
    pub(crate) fn emit_state(&self, state: ConnectionState) {
        self.emit(MediaEvent::StateChanged(state));
    }

    fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(PeerEvent {
            peer: self.peer.clone(),
            event,
        });
    }

    fn maybe_connect(&self) {
        let connect = {
            let mut inner = self.inner.lock();
            let ready = inner.local.is_some() && inner.remote.is_some();
            if ready && !inner.connected && !inner.closed {
                inner.connected = true;
                true
            } else {
                false
            }
        };
        if connect {
            self.emit_state(ConnectionState::Connecting);
            self.emit_state(ConnectionState::Connected);
        }
    }

    fn check_open(&self) -> CallResult<()> {
        if self.inner.lock().closed {
            return Err(CallError::negotiation(&self.peer, "context closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Negotiation for FakeNegotiation {
    async fn create_offer(&self) -> CallResult<SessionDescription> {
        self.check_open()?;
        self.inner.lock().offers += 1;
        Ok(SessionDescription::offer(format!("v=0 offer for {}", self.peer)))
    }

    async fn create_answer(&self) -> CallResult<SessionDescription> {
        self.check_open()?;
        if self.fail_answers.load(Ordering::SeqCst) {
            return Err(CallError::Media("answer failed".into()));
        }
        let mut inner = self.inner.lock();
        if !matches!(&inner.remote, Some(desc) if desc.kind == SdpKind::Offer) {
            return Err(CallError::negotiation(&self.peer, "answer without remote offer"));
        }
        inner.answers += 1;
        Ok(SessionDescription::answer(format!("v=0 answer for {}", self.peer)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()> {
        self.check_open()?;
        self.inner.lock().local = Some(description);
        self.emit(MediaEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:fake {}", self.peer),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()> {
        self.check_open()?;
        self.inner.lock().remote = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        self.check_open()?;
        self.inner.lock().applied.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.inner.lock().closed = true;
    }
}
