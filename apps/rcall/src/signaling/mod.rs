//! Room signaling: the wire envelope and the reconnecting WebSocket channel
//! that carries it to the relay.

mod client;
pub mod envelope;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub use client::{DEFAULT_RECONNECT_DELAY, NORMAL_CLOSURE, SignalingChannel, SignalingConfig};
pub use envelope::{DecodeError, Envelope, EnvelopeBody, IceCandidateDescriptor};

/// Opaque peer identifier. Compared lexicographically to decide politeness.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RoomId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The local peer is polite when its id sorts after the remote id.
pub fn is_polite(local: &PeerId, remote: &PeerId) -> bool {
    local > remote
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingConnectionState {
    Idle,
    Connecting,
    Open(RoomId),
    Closed,
    ReconnectPending,
}

/// Inbound notifications from the relay, already filtered of anything this
/// peer sent itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Open {
        room: RoomId,
    },
    PeerJoined {
        peer_id: PeerId,
    },
    Offer {
        from: PeerId,
        sdp: String,
    },
    Answer {
        from: PeerId,
        sdp: String,
    },
    Ice {
        from: PeerId,
        candidate: IceCandidateDescriptor,
    },
    ServerError {
        payload: String,
    },
    Closed {
        reason: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    ChannelClosed,
}
