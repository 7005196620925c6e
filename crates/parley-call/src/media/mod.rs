//! Media capabilities behind the peer connection manager.
//!
//! [`MediaEngine`] opens the local microphone and creates one negotiation
//! context per remote session. Contexts report ICE candidates and connection
//! state changes through a [`PeerEventSink`] so the call controller can
//! consume them on its own event loop instead of inside media callbacks.

mod rtc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{CallError, CallResult};
use crate::session_key::SessionKey;

pub use self::rtc::WebRtcMediaEngine;

/// One Opus frame of silence; sent while the microphone is muted so the
/// remote jitter buffer keeps running.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const PLAYBACK_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Transitions the connection manager accepts. Anything else is logged
    /// and ignored.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (New, Connecting | Connected | Disconnected | Failed | Closed) => true,
            (Connecting, Connected | Disconnected | Failed | Closed) => true,
            (Connected, Disconnected | Failed | Closed) => true,
            (Disconnected, Connecting | Connected | Failed | Closed) => true,
            (Failed, Closed) => true,
            _ => false,
        }
    }

    /// States that end a one-to-one call.
    pub fn ends_call(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    RemoteAudio,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub peer: SessionKey,
    pub event: MediaEvent,
}

pub type PeerEventSink = mpsc::UnboundedSender<PeerEvent>;

/// Local microphone track shared by every negotiation context of a call.
///
/// Clones share state, so muting or stopping through any handle affects all
/// peers at once.
#[derive(Clone)]
pub struct LocalAudio {
    inner: Arc<LocalAudioInner>,
}

struct LocalAudioInner {
    device: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    loopback: AtomicBool,
    track: Option<Arc<TrackLocalStaticSample>>,
    playback: broadcast::Sender<Bytes>,
}

impl LocalAudio {
    pub fn new(device: impl Into<String>, track: Option<Arc<TrackLocalStaticSample>>) -> Self {
        let (playback, _) = broadcast::channel(PLAYBACK_BUFFER);
        Self {
            inner: Arc::new(LocalAudioInner {
                device: device.into(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                loopback: AtomicBool::new(false),
                track,
                playback,
            }),
        }
    }

    /// Audio without an RTP track, for engines that do not send media.
    pub fn detached(device: impl Into<String>) -> Self {
        Self::new(device, None)
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }

    pub fn track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.inner.track.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Releases the capture. Idempotent; frames pushed afterwards are dropped.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.enabled.store(false, Ordering::SeqCst);
            self.inner.loopback.store(false, Ordering::SeqCst);
            tracing::debug!(target = "parley::media", device = %self.inner.device, "local audio stopped");
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.inner.loopback.load(Ordering::SeqCst)
    }

    /// Routes captured frames to local playback as well.
    pub fn set_loopback(&self, enabled: bool) {
        self.inner.loopback.store(enabled, Ordering::SeqCst);
    }

    pub fn playback(&self) -> broadcast::Receiver<Bytes> {
        self.inner.playback.subscribe()
    }

    /// Feeds one encoded frame from the capture device.
    pub async fn push_frame(&self, frame: Bytes, duration: Duration) -> CallResult<()> {
        if self.is_stopped() {
            return Ok(());
        }
        if self.is_loopback() {
            let _ = self.inner.playback.send(frame.clone());
        }
        let Some(track) = &self.inner.track else {
            return Ok(());
        };
        let data = if self.is_enabled() {
            frame
        } else {
            Bytes::from_static(OPUS_SILENCE)
        };
        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|err| CallError::Media(err.to_string()))
    }
}

impl std::fmt::Debug for LocalAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudio")
            .field("device", &self.inner.device)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Opens the microphone. Fails with [`CallError::MediaAccess`] when no
    /// capture device can be used.
    async fn capture_audio(&self) -> CallResult<LocalAudio>;

    async fn create_context(
        &self,
        peer: &SessionKey,
        audio: &LocalAudio,
        events: PeerEventSink,
    ) -> CallResult<Arc<dyn Negotiation>>;
}

/// One negotiation context with a single remote session.
#[async_trait]
pub trait Negotiation: Send + Sync {
    async fn create_offer(&self) -> CallResult<SessionDescription>;
    async fn create_answer(&self) -> CallResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()>;
    async fn close(&self);
}
