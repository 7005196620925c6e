use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectionState, IceCandidate, LocalAudio, MediaEngine, MediaEvent, Negotiation, PeerEvent,
    PeerEventSink, SdpKind, SessionDescription,
};
use crate::config::MediaConfig;
use crate::error::{CallError, CallResult};
use crate::session_key::SessionKey;

const OPUS_CLOCK_RATE: u32 = 48_000;
const OPUS_CHANNELS: u16 = 2;
const RTCP_BUFFER: usize = 1500;

/// Media engine backed by webrtc-rs peer connections.
pub struct WebRtcMediaEngine {
    api: API,
    config: MediaConfig,
}

impl WebRtcMediaEngine {
    pub fn new(config: MediaConfig) -> CallResult<Self> {
        Ok(Self {
            api: build_api(SettingEngine::default())?,
            config,
        })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

fn build_api(setting: SettingEngine) -> CallResult<API> {
    let mut media_engine = RtcMediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_media_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_media_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn capture_audio(&self) -> CallResult<LocalAudio> {
        let Some(device) = &self.config.audio_device else {
            return Err(CallError::MediaAccess(
                "no audio capture device configured".to_string(),
            ));
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: OPUS_CHANNELS,
                ..Default::default()
            },
            "audio".to_owned(),
            format!("parley-{device}"),
        ));
        tracing::debug!(target = "parley::media", %device, "opened local audio track");
        Ok(LocalAudio::new(device.clone(), Some(track)))
    }

    async fn create_context(
        &self,
        peer: &SessionKey,
        audio: &LocalAudio,
        events: PeerEventSink,
    ) -> CallResult<Arc<dyn Negotiation>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_media_error)?,
        );

        if let Some(track) = audio.track() {
            let sender = pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(to_media_error)?;
            // Interceptors only run while RTCP is being read.
            tokio::spawn(async move {
                let mut buf = vec![0u8; RTCP_BUFFER];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let candidate_events = events.clone();
        let candidate_peer = peer.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            let peer = candidate_peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent {
                            peer,
                            event: MediaEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "parley::media",
                            %peer,
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let state_events = events.clone();
        let state_peer = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            let peer = state_peer.clone();
            Box::pin(async move {
                tracing::debug!(target = "parley::media", %peer, ?state, "peer connection state changed");
                if let Some(state) = map_state(state) {
                    let _ = events.send(PeerEvent {
                        peer,
                        event: MediaEvent::StateChanged(state),
                    });
                }
            })
        }));

        let track_peer = peer.clone();
        pc.on_track(Box::new(move |_track, _receiver, _transceiver| {
            let events = events.clone();
            let peer = track_peer.clone();
            Box::pin(async move {
                tracing::debug!(target = "parley::media", %peer, "remote audio track");
                let _ = events.send(PeerEvent {
                    peer,
                    event: MediaEvent::RemoteAudio,
                });
            })
        }));

        Ok(Arc::new(WebRtcNegotiation {
            peer: peer.clone(),
            pc,
            last_created: Mutex::new(None),
        }))
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

struct WebRtcNegotiation {
    peer: SessionKey,
    pc: Arc<RTCPeerConnection>,
    // The description object returned by create_offer/create_answer, applied
    // as-is when the same SDP is set locally.
    last_created: Mutex<Option<RTCSessionDescription>>,
}

impl WebRtcNegotiation {
    fn to_rtc(&self, description: SessionDescription) -> CallResult<RTCSessionDescription> {
        if let Some(created) = self.last_created.lock().take() {
            if created.sdp == description.sdp {
                return Ok(created);
            }
        }
        match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|err| CallError::negotiation(&self.peer, err))
    }

    fn remember(&self, kind: SdpKind, created: RTCSessionDescription) -> SessionDescription {
        let description = SessionDescription {
            kind,
            sdp: created.sdp.clone(),
        };
        *self.last_created.lock() = Some(created);
        description
    }
}

#[async_trait]
impl Negotiation for WebRtcNegotiation {
    async fn create_offer(&self) -> CallResult<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| CallError::negotiation(&self.peer, err))?;
        Ok(self.remember(SdpKind::Offer, offer))
    }

    async fn create_answer(&self) -> CallResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| CallError::negotiation(&self.peer, err))?;
        Ok(self.remember(SdpKind::Answer, answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()> {
        let description = self.to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| CallError::negotiation(&self.peer, err))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()> {
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|err| CallError::negotiation(&self.peer, err))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| CallError::negotiation(&self.peer, err))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| CallError::negotiation(&self.peer, err))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::warn!(target = "parley::media", peer = %self.peer, error = %err, "peer connection close failed");
        }
    }
}

fn to_media_error<E: std::fmt::Display>(err: E) -> CallError {
    CallError::Media(err.to_string())
}
