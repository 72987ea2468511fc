//! Perfect Negotiation: who offers, how offer collisions resolve, and when
//! remote ICE candidates may be applied.

mod ice_queue;
mod machine;
mod worker;

use thiserror::Error;

use crate::media::{SdpKind, SessionDescription};
use crate::signaling::{IceCandidateDescriptor, PeerId};

pub use ice_queue::{IceAdmission, IceCandidateQueue};
pub use machine::Negotiator;
pub use worker::{NegotiationHandle, spawn_worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Stable,
    /// Local offer being created or applied.
    OfferInFlight,
    /// Local offer applied; waiting for the remote answer.
    AwaitingAnswer,
    /// Remote offer applied; an answer is owed.
    RemoteOfferPending,
    /// Polite peer discarding its own offer after a collision.
    RollingBack,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Polite,
    Impolite,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("offer collision; keeping the local offer")]
    Collision,
    #[error("failed to create session description: {0}")]
    SdpCreate(String),
    #[error("failed to apply session description: {0}")]
    SdpApply(String),
    #[error("failed to create peer connection: {0}")]
    PeerConnectionCreate(String),
    #[error("no remote offer to answer")]
    NoRemoteOffer,
    #[error("failed to add ice candidate: {0}")]
    IceCandidate(String),
    #[error("unexpected remote {0} description")]
    UnexpectedDescription(SdpKind),
    #[error("negotiation closed")]
    Closed,
    #[error("negotiation worker stopped")]
    WorkerStopped,
}

impl NegotiationError {
    /// Collisions are part of normal operation, not failures.
    pub fn is_collision(&self) -> bool {
        matches!(self, NegotiationError::Collision)
    }
}

/// Work items processed one at a time, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationCommand {
    PeerDiscovered(PeerId),
    CreateOffer,
    /// Apply a remote offer and answer it.
    RemoteOffer { from: PeerId, sdp: String },
    RemoteAnswer { sdp: String },
    RemoteCandidate(IceCandidateDescriptor),
    Close,
}

impl NegotiationCommand {
    pub fn name(&self) -> &'static str {
        match self {
            NegotiationCommand::PeerDiscovered(_) => "peer_discovered",
            NegotiationCommand::CreateOffer => "create_offer",
            NegotiationCommand::RemoteOffer { .. } => "remote_offer",
            NegotiationCommand::RemoteAnswer { .. } => "remote_answer",
            NegotiationCommand::RemoteCandidate(_) => "remote_candidate",
            NegotiationCommand::Close => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// A local offer or answer ready to be signalled.
    LocalDescription(SessionDescription),
    Failed {
        operation: &'static str,
        error: NegotiationError,
    },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationSnapshot {
    pub phase: NegotiationPhase,
    pub role: Option<Role>,
    pub remote_peer: Option<PeerId>,
    pub pending_candidates: usize,
}
