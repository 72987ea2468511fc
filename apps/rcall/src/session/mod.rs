//! Routes signaling events into the negotiation worker and local
//! descriptions and candidates back out to the relay.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::media::{MediaEngine, PeerConnectionEvent, PeerConnectionState, SdpKind};
use crate::negotiation::{
    NegotiationCommand, NegotiationError, NegotiationEvent, NegotiationHandle, spawn_worker,
};
use crate::signaling::{
    EnvelopeBody, PeerId, RoomId, SignalingChannel, SignalingConnectionState, SignalingEvent,
};

/// What the UI layer is told about a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignalingOpen { room: RoomId },
    SignalingClosed { reason: String },
    PeerJoined { peer_id: PeerId },
    MediaConnected,
    MediaDisconnected { reason: String },
    NegotiationFailed(NegotiationError),
    ServerError { payload: String },
}

pub struct Session {
    signaling: SignalingChannel,
    negotiation: NegotiationHandle,
    router: JoinHandle<()>,
}

impl Session {
    /// Spawns the negotiation worker and the router task. `peer_events` must
    /// be the receiver paired with the sender given to `engine`.
    pub fn start<E: MediaEngine>(
        engine: Arc<E>,
        signaling: SignalingChannel,
        signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
        peer_events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (negotiation, negotiation_events) = spawn_worker(engine, signaling.peer_id().clone());
        let (ui, ui_events) = mpsc::unbounded_channel();
        let router = tokio::spawn(
            Router {
                signaling: signaling.clone(),
                negotiation: negotiation.clone(),
                ui,
            }
            .run(signaling_events, negotiation_events, peer_events),
        );
        (
            Self {
                signaling,
                negotiation,
                router,
            },
            ui_events,
        )
    }

    pub fn peer_id(&self) -> &PeerId {
        self.signaling.peer_id()
    }

    pub fn join(&self, room: impl Into<RoomId>) {
        self.signaling.connect(room);
    }

    pub fn signaling_state(&self) -> SignalingConnectionState {
        self.signaling.state()
    }

    pub fn negotiation(&self) -> &NegotiationHandle {
        &self.negotiation
    }

    /// Starts a renegotiation from this side.
    pub fn renegotiate(&self) -> bool {
        self.negotiation.submit(NegotiationCommand::CreateOffer)
    }

    /// Leaves the room, then closes negotiation once queued work has run.
    pub async fn hang_up(&self) {
        self.signaling.leave();
        if let Err(err) = self.negotiation.close().await {
            tracing::warn!(target = "rcall::session", error = %err, "close failed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.router.abort();
    }
}

struct Router {
    signaling: SignalingChannel,
    negotiation: NegotiationHandle,
    ui: mpsc::UnboundedSender<SessionEvent>,
}

impl Router {
    async fn run(
        self,
        mut signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
        mut negotiation_events: mpsc::UnboundedReceiver<NegotiationEvent>,
        mut peer_events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = signaling_events.recv() => self.on_signaling(event),
                Some(event) = negotiation_events.recv() => self.on_negotiation(event),
                Some(event) = peer_events.recv() => self.on_peer_connection(event),
                else => break,
            }
        }
        tracing::debug!(target = "rcall::session", "session router stopped");
    }

    fn on_signaling(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Open { room } => self.notify(SessionEvent::SignalingOpen { room }),
            SignalingEvent::PeerJoined { peer_id } => {
                self.negotiate(NegotiationCommand::PeerDiscovered(peer_id.clone()));
                self.notify(SessionEvent::PeerJoined { peer_id });
            }
            SignalingEvent::Offer { from, sdp } => {
                self.negotiate(NegotiationCommand::RemoteOffer { from, sdp });
            }
            SignalingEvent::Answer { sdp, .. } => {
                self.negotiate(NegotiationCommand::RemoteAnswer { sdp });
            }
            SignalingEvent::Ice { candidate, .. } => {
                self.negotiate(NegotiationCommand::RemoteCandidate(candidate));
            }
            SignalingEvent::ServerError { payload } => {
                self.notify(SessionEvent::ServerError { payload });
            }
            SignalingEvent::Closed { reason } => {
                self.notify(SessionEvent::SignalingClosed { reason });
            }
        }
    }

    fn on_negotiation(&self, event: NegotiationEvent) {
        match event {
            NegotiationEvent::LocalDescription(desc) => {
                let body = match desc.kind {
                    SdpKind::Offer => EnvelopeBody::Offer { sdp: desc.sdp },
                    SdpKind::Answer => EnvelopeBody::Answer { sdp: desc.sdp },
                    SdpKind::Rollback => return,
                };
                self.signaling.send(body);
            }
            NegotiationEvent::Failed { error, .. } if error.is_collision() => {}
            NegotiationEvent::Failed { error, .. } => {
                self.notify(SessionEvent::NegotiationFailed(error));
            }
            NegotiationEvent::Closed => {
                tracing::debug!(target = "rcall::session", "negotiation closed");
            }
        }
    }

    fn on_peer_connection(&self, event: PeerConnectionEvent) {
        match event {
            PeerConnectionEvent::LocalCandidate(candidate) => {
                self.signaling.send(EnvelopeBody::Ice { candidate });
            }
            PeerConnectionEvent::StateChanged(PeerConnectionState::Connected) => {
                tracing::info!(target = "rcall::session", "media connected");
                self.notify(SessionEvent::MediaConnected);
            }
            PeerConnectionEvent::StateChanged(state) if state.is_down() => {
                tracing::info!(target = "rcall::session", ?state, "media disconnected");
                self.notify(SessionEvent::MediaDisconnected {
                    reason: format!("{state:?}").to_lowercase(),
                });
            }
            PeerConnectionEvent::StateChanged(_) => {}
            PeerConnectionEvent::RenegotiationNeeded => {
                tracing::debug!(target = "rcall::session", "renegotiation needed");
            }
        }
    }

    fn negotiate(&self, command: NegotiationCommand) {
        if !self.negotiation.submit(command) {
            tracing::debug!(
                target = "rcall::session",
                "negotiation worker stopped; dropping command"
            );
        }
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.ui.send(event);
    }
}
