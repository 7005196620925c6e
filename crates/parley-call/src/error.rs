use parley_store::StoreError;
use thiserror::Error;

use crate::session_key::SessionKey;

#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Local audio could not be opened. Surfaced to the user, never retried.
    #[error("microphone unavailable: {0}")]
    MediaAccess(String),

    /// Both transports failed for one signaling message.
    #[error("signal to {to} not delivered: {reason}")]
    SignalDelivery { to: SessionKey, reason: String },

    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: SessionKey, reason: String },

    /// Roster join/leave failed on both transports.
    #[error("roster write failed: {0}")]
    RegistryWrite(String),

    #[error("a call is already in progress")]
    AlreadyActive,

    #[error("no active call")]
    NotInCall,

    #[error("call start was cancelled")]
    Cancelled,

    #[error("media stack error: {0}")]
    Media(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CallResult<T> = Result<T, CallError>;

impl CallError {
    pub fn negotiation(peer: &SessionKey, err: impl std::fmt::Display) -> Self {
        CallError::Negotiation {
            peer: peer.clone(),
            reason: err.to_string(),
        }
    }

    /// Errors a user has to see; everything else is logged and recovered from.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, CallError::MediaAccess(_))
    }
}
