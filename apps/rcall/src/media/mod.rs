//! The peer-connection seam. [`MediaEngine`] is everything negotiation needs
//! from a WebRTC stack; [`webrtc::WebRtcEngine`] provides it on top of the
//! `webrtc` crate and [`mock::MockEngine`] provides it in memory.

pub mod config;
pub mod env;
pub mod mock;
pub mod sink;
pub mod webrtc;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::signaling::IceCandidateDescriptor;

pub use config::EngineConfig;
pub use env::MediaEnvironment;
pub use sink::{MediaSink, MediaSinks, RemoteTrack, TrackKind, TracingSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpKind {
    Offer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Rollback => "rollback",
        })
    }
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

    /// Pseudo-description that discards a pending local offer.
    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(err: impl fmt::Display) -> Self {
        Self(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_down(self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

/// Notifications an engine raises outside of any negotiation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerConnectionEvent {
    LocalCandidate(IceCandidateDescriptor),
    StateChanged(PeerConnectionState),
    RenegotiationNeeded,
}

/// The offer/answer capability a peer connection exposes.
///
/// Implementations keep the usual signaling-state rules: a local offer moves
/// to have-local-offer, a remote offer to have-remote-offer, and an answer or
/// a rollback back to stable.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    /// Also accepts [`SessionDescription::rollback`].
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidateDescriptor) -> Result<(), EngineError>;

    async fn has_remote_description(&self) -> bool;

    async fn close(&self) -> Result<(), EngineError>;
}
