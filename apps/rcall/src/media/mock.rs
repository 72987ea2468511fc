use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    EngineError, MediaEngine, PeerConnectionEvent, PeerConnectionState, SdpKind,
    SessionDescription,
};
use crate::signaling::IceCandidateDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockSignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Engine call that [`MockEngine::fail_next`] makes fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    Rollback,
}

/// In-memory engine following offer/answer signaling-state rules. Every
/// applied local description yields one synthetic host candidate, and
/// reaching stable with both descriptions reports `Connected`.
pub struct MockEngine {
    label: String,
    events: mpsc::UnboundedSender<PeerConnectionEvent>,
    state: Mutex<MockState>,
}

struct MockState {
    signaling: MockSignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidateDescriptor>,
    descriptions_created: u32,
    rollbacks: u32,
    connected: bool,
    fail_next: Option<FailPoint>,
}

impl MockEngine {
    pub fn new(label: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<PeerConnectionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let engine = Self {
            label: label.into(),
            events,
            state: Mutex::new(MockState {
                signaling: MockSignalingState::Stable,
                local: None,
                remote: None,
                pending_local: None,
                applied_candidates: Vec::new(),
                descriptions_created: 0,
                rollbacks: 0,
                connected: false,
                fail_next: None,
            }),
        };
        (engine, receiver)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn signaling_state(&self) -> MockSignalingState {
        self.state.lock().signaling
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidateDescriptor> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn rollbacks(&self) -> u32 {
        self.state.lock().rollbacks
    }

    pub fn fail_next(&self, point: FailPoint) {
        self.state.lock().fail_next = Some(point);
    }

    /// The candidate this engine reports after applying a local description.
    pub fn host_candidate(&self) -> IceCandidateDescriptor {
        IceCandidateDescriptor::new(
            format!("candidate:{} 1 udp 2122260223 127.0.0.1 9 typ host", self.label),
            Some("0".into()),
            0,
        )
    }

    fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.events.send(event);
    }
}

impl MockState {
    fn check(&mut self, point: FailPoint) -> Result<(), EngineError> {
        if self.signaling == MockSignalingState::Closed {
            return Err(EngineError("peer connection closed".into()));
        }
        if self.fail_next == Some(point) {
            self.fail_next = None;
            return Err(EngineError(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    fn invalid(&self, action: &str) -> EngineError {
        EngineError(format!("cannot {action} in state {:?}", self.signaling))
    }

    /// True exactly once, when the connection first settles.
    fn settle(&mut self) -> bool {
        if self.signaling == MockSignalingState::Stable
            && self.local.is_some()
            && self.remote.is_some()
            && !self.connected
        {
            self.connected = true;
            return true;
        }
        false
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateOffer)?;
        if state.signaling == MockSignalingState::HaveRemoteOffer {
            return Err(state.invalid("create offer"));
        }
        state.descriptions_created += 1;
        Ok(SessionDescription::offer(format!(
            "offer:{}:{}",
            self.label, state.descriptions_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateAnswer)?;
        if state.signaling != MockSignalingState::HaveRemoteOffer {
            return Err(state.invalid("create answer"));
        }
        state.descriptions_created += 1;
        Ok(SessionDescription::answer(format!(
            "answer:{}:{}",
            self.label, state.descriptions_created
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let settled = {
            let mut state = self.state.lock();
            match desc.kind {
                SdpKind::Rollback => {
                    state.check(FailPoint::Rollback)?;
                    if state.signaling != MockSignalingState::HaveLocalOffer {
                        return Err(state.invalid("roll back"));
                    }
                    state.pending_local = None;
                    state.signaling = MockSignalingState::Stable;
                    state.rollbacks += 1;
                    return Ok(());
                }
                SdpKind::Offer => {
                    state.check(FailPoint::SetLocal)?;
                    if !matches!(
                        state.signaling,
                        MockSignalingState::Stable | MockSignalingState::HaveLocalOffer
                    ) {
                        return Err(state.invalid("apply local offer"));
                    }
                    state.pending_local = Some(desc);
                    state.signaling = MockSignalingState::HaveLocalOffer;
                    false
                }
                SdpKind::Answer => {
                    state.check(FailPoint::SetLocal)?;
                    if state.signaling != MockSignalingState::HaveRemoteOffer {
                        return Err(state.invalid("apply local answer"));
                    }
                    state.local = Some(desc);
                    state.signaling = MockSignalingState::Stable;
                    state.settle()
                }
            }
        };
        self.emit(PeerConnectionEvent::LocalCandidate(self.host_candidate()));
        if settled {
            self.emit(PeerConnectionEvent::StateChanged(PeerConnectionState::Connected));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let settled = {
            let mut state = self.state.lock();
            state.check(FailPoint::SetRemote)?;
            match desc.kind {
                SdpKind::Offer => {
                    if state.signaling == MockSignalingState::HaveLocalOffer {
                        return Err(state.invalid("apply remote offer"));
                    }
                    state.remote = Some(desc);
                    state.signaling = MockSignalingState::HaveRemoteOffer;
                    false
                }
                SdpKind::Answer => {
                    if state.signaling != MockSignalingState::HaveLocalOffer {
                        return Err(state.invalid("apply remote answer"));
                    }
                    state.local = state.pending_local.take();
                    state.remote = Some(desc);
                    state.signaling = MockSignalingState::Stable;
                    state.settle()
                }
                SdpKind::Rollback => return Err(state.invalid("apply remote rollback")),
            }
        };
        if settled {
            self.emit(PeerConnectionEvent::StateChanged(PeerConnectionState::Connected));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateDescriptor) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.signaling == MockSignalingState::Closed {
            return Err(EngineError("peer connection closed".into()));
        }
        if state.remote.is_none() {
            return Err(EngineError("no remote description".into()));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.signaling == MockSignalingState::Closed {
            return Ok(());
        }
        state.signaling = MockSignalingState::Closed;
        drop(state);
        self.emit(PeerConnectionEvent::StateChanged(PeerConnectionState::Closed));
        Ok(())
    }
}
