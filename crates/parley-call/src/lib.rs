//! Parley call core: one-to-one voice calls between sessions in a room.
//!
//! Responsibilities:
//! - keeping a room roster in the realtime store
//! - exchanging offers, answers and ICE candidates through per-session inboxes
//! - driving one WebRTC negotiation per remote session with glare avoidance
//! - tying roster, signaling and media into a single call lifecycle

pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod paths;
pub mod peers;
pub mod registry;
pub mod session_key;
pub mod signaling;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod tests;

pub use config::{CallConfig, MediaConfig};
pub use controller::{
    CallController, CallHistorySink, CallNotification, CallRecord, CallState, EndReason, NoHistory,
};
pub use error::{CallError, CallResult};
pub use media::{
    ConnectionState, IceCandidate, LocalAudio, MediaEngine, MediaEvent, Negotiation, PeerEvent,
    SessionDescription, WebRtcMediaEngine,
};
pub use peers::{NegotiationPhase, PeerConnectionManager};
pub use registry::{Participant, Roster, RosterEntry, SessionRegistry};
pub use session_key::{should_offer, SessionKey};
pub use signaling::{InboundSignal, SignalMessage, SignalPayload, SignalingChannel};
pub use transport::{DualTransport, Route};
