use std::sync::Arc;

use super::{
    IceAdmission, IceCandidateQueue, NegotiationError, NegotiationPhase, NegotiationSnapshot,
    Role,
};
use crate::media::{MediaEngine, SdpKind, SessionDescription};
use crate::signaling::{IceCandidateDescriptor, PeerId, is_polite};

/// Perfect Negotiation over one [`MediaEngine`].
///
/// Not internally synchronised: callers run every operation to completion
/// before starting the next (see [`super::spawn_worker`]).
pub struct Negotiator<E> {
    engine: Arc<E>,
    local_id: PeerId,
    remote_id: Option<PeerId>,
    role: Option<Role>,
    phase: NegotiationPhase,
    ice: IceCandidateQueue,
}

impl<E: MediaEngine> Negotiator<E> {
    pub fn new(engine: Arc<E>, local_id: PeerId) -> Self {
        Self {
            engine,
            local_id,
            remote_id: None,
            role: None,
            phase: NegotiationPhase::Stable,
            ice: IceCandidateQueue::new(),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_polite(&self) -> bool {
        self.role == Some(Role::Polite)
    }

    pub fn making_offer(&self) -> bool {
        matches!(
            self.phase,
            NegotiationPhase::OfferInFlight | NegotiationPhase::AwaitingAnswer
        )
    }

    pub fn is_remote_answer_pending(&self) -> bool {
        self.phase == NegotiationPhase::AwaitingAnswer
    }

    pub fn pending_candidates(&self) -> usize {
        self.ice.len()
    }

    pub fn snapshot(&self) -> NegotiationSnapshot {
        NegotiationSnapshot {
            phase: self.phase,
            role: self.role,
            remote_peer: self.remote_id.clone(),
            pending_candidates: self.ice.len(),
        }
    }

    /// Records the remote peer and fixes the role. Returns `true` only on the
    /// call that decided it; the role never changes afterwards.
    pub fn note_remote_peer(&mut self, remote: &PeerId) -> bool {
        if *remote == self.local_id {
            tracing::warn!(
                target = "rcall::negotiation",
                peer_id = %remote,
                "ignoring own id as remote peer"
            );
            return false;
        }
        if let Some(known) = &self.remote_id {
            if known != remote {
                tracing::warn!(
                    target = "rcall::negotiation",
                    known = %known,
                    peer_id = %remote,
                    "role already fixed for another peer; ignoring"
                );
            }
            return false;
        }
        let role = if is_polite(&self.local_id, remote) {
            Role::Polite
        } else {
            Role::Impolite
        };
        tracing::info!(
            target = "rcall::negotiation",
            local = %self.local_id,
            remote = %remote,
            role = ?role,
            "negotiation role decided"
        );
        self.remote_id = Some(remote.clone());
        self.role = Some(role);
        true
    }

    /// Fixes the role for `remote`; the impolite side offers straight away.
    pub async fn on_peer_discovered(
        &mut self,
        remote: &PeerId,
    ) -> Result<Option<SessionDescription>, NegotiationError> {
        self.ensure_open()?;
        if !self.note_remote_peer(remote) {
            return Ok(None);
        }
        match self.role {
            Some(Role::Impolite) => self.create_offer().await,
            _ => Ok(None),
        }
    }

    /// Creates and applies a local offer. Returns `Ok(None)` when the phase
    /// does not allow a new offer (one is already outstanding, or an answer
    /// is owed).
    pub async fn create_offer(&mut self) -> Result<Option<SessionDescription>, NegotiationError> {
        self.ensure_open()?;
        if self.phase != NegotiationPhase::Stable {
            tracing::debug!(
                target = "rcall::negotiation",
                phase = ?self.phase,
                "offer not started"
            );
            return Ok(None);
        }

        self.phase = NegotiationPhase::OfferInFlight;
        let offer = match self.engine.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                self.phase = NegotiationPhase::Stable;
                return Err(NegotiationError::SdpCreate(err.0));
            }
        };
        if let Err(err) = self.engine.set_local_description(offer.clone()).await {
            self.phase = NegotiationPhase::Stable;
            return Err(NegotiationError::SdpApply(err.0));
        }
        self.phase = NegotiationPhase::AwaitingAnswer;
        tracing::debug!(target = "rcall::negotiation", "local offer applied");
        Ok(Some(offer))
    }

    pub async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.phase != NegotiationPhase::RemoteOfferPending {
            return Err(NegotiationError::NoRemoteOffer);
        }
        let answer = self
            .engine
            .create_answer()
            .await
            .map_err(|err| NegotiationError::SdpCreate(err.0))?;
        self.engine
            .set_local_description(answer.clone())
            .await
            .map_err(|err| NegotiationError::SdpApply(err.0))?;
        self.phase = NegotiationPhase::Stable;
        tracing::debug!(target = "rcall::negotiation", "local answer applied");
        Ok(answer)
    }

    /// Applies a remote offer or answer, resolving offer collisions by role.
    ///
    /// The impolite side refuses a colliding offer with
    /// [`NegotiationError::Collision`] and keeps its own; the polite side rolls
    /// its offer back and takes the remote one, after which an answer is owed.
    pub async fn apply_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        match desc.kind {
            SdpKind::Rollback => Err(NegotiationError::UnexpectedDescription(SdpKind::Rollback)),
            SdpKind::Offer => self.apply_remote_offer(desc).await,
            SdpKind::Answer => self.apply_remote_answer(desc).await,
        }
    }

    async fn apply_remote_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        if self.making_offer() {
            if !self.is_polite() {
                tracing::debug!(
                    target = "rcall::negotiation",
                    "offer collision; impolite peer keeps its offer"
                );
                return Err(NegotiationError::Collision);
            }
            let resume = self.phase;
            self.phase = NegotiationPhase::RollingBack;
            if let Err(err) = self
                .engine
                .set_local_description(SessionDescription::rollback())
                .await
            {
                self.phase = resume;
                return Err(NegotiationError::SdpApply(err.0));
            }
            self.phase = NegotiationPhase::Stable;
            tracing::info!(
                target = "rcall::negotiation",
                "offer collision; polite peer rolled back its offer"
            );
        }

        self.engine
            .set_remote_description(offer)
            .await
            .map_err(|err| NegotiationError::SdpApply(err.0))?;
        self.phase = NegotiationPhase::RemoteOfferPending;
        tracing::debug!(target = "rcall::negotiation", "remote offer applied");
        self.drain_candidates().await;
        Ok(())
    }

    async fn apply_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if let Err(err) = self.engine.set_remote_description(answer).await {
            if self.is_remote_answer_pending() {
                // Discard the unanswerable offer so a later offer can start clean.
                if let Err(rollback) = self
                    .engine
                    .set_local_description(SessionDescription::rollback())
                    .await
                {
                    tracing::warn!(
                        target = "rcall::negotiation",
                        error = %rollback,
                        "rollback after rejected answer failed"
                    );
                }
                self.phase = NegotiationPhase::Stable;
            }
            return Err(NegotiationError::SdpApply(err.0));
        }
        if !self.is_remote_answer_pending() {
            tracing::debug!(
                target = "rcall::negotiation",
                phase = ?self.phase,
                "applied answer without an outstanding offer"
            );
        }
        self.phase = NegotiationPhase::Stable;
        tracing::debug!(target = "rcall::negotiation", "remote answer applied");
        self.drain_candidates().await;
        Ok(())
    }

    /// Forwards the candidate if a remote description is set, else queues it.
    pub async fn add_ice_candidate(
        &mut self,
        candidate: IceCandidateDescriptor,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let ready = self.engine.has_remote_description().await;
        match self.ice.offer(candidate, ready) {
            IceAdmission::Forward(candidate) => self
                .engine
                .add_ice_candidate(candidate)
                .await
                .map_err(|err| NegotiationError::IceCandidate(err.0)),
            IceAdmission::Queued { pending } => {
                tracing::trace!(
                    target = "rcall::negotiation",
                    pending,
                    "queued remote candidate until a remote description is set"
                );
                Ok(())
            }
        }
    }

    async fn drain_candidates(&mut self) {
        let queued = self.ice.drain();
        if queued.is_empty() {
            return;
        }
        tracing::debug!(
            target = "rcall::negotiation",
            count = queued.len(),
            "draining queued remote candidates"
        );
        for candidate in queued {
            if let Err(err) = self.engine.add_ice_candidate(candidate).await {
                tracing::warn!(
                    target = "rcall::negotiation",
                    error = %err,
                    "queued remote candidate rejected"
                );
            }
        }
    }

    /// Releases the engine. Further operations fail with `Closed`.
    pub async fn close(&mut self) -> Result<(), NegotiationError> {
        if self.phase == NegotiationPhase::Closed {
            return Ok(());
        }
        self.phase = NegotiationPhase::Closed;
        self.ice.clear();
        if let Err(err) = self.engine.close().await {
            tracing::warn!(
                target = "rcall::negotiation",
                error = %err,
                "engine close failed"
            );
        }
        tracing::debug!(target = "rcall::negotiation", "negotiation closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.phase == NegotiationPhase::Closed {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{FailPoint, MockEngine, MockSignalingState};

    fn negotiator(id: &str) -> Negotiator<MockEngine> {
        let (engine, _events) = MockEngine::new(id);
        Negotiator::new(Arc::new(engine), PeerId::from(id))
    }

    fn candidate(n: u32) -> IceCandidateDescriptor {
        IceCandidateDescriptor::new(format!("candidate:{n}"), Some("0".into()), 0)
    }

    #[tokio::test]
    async fn impolite_offers_on_discovery() {
        let mut a = negotiator("a1");
        let offer = a.on_peer_discovered(&PeerId::from("b2")).await.unwrap();
        assert!(offer.is_some());
        assert_eq!(a.role(), Some(Role::Impolite));
        assert_eq!(a.phase(), NegotiationPhase::AwaitingAnswer);
        assert!(a.making_offer());
        assert!(a.is_remote_answer_pending());
    }

    #[tokio::test]
    async fn polite_waits_on_discovery() {
        let mut b = negotiator("b2");
        let offer = b.on_peer_discovered(&PeerId::from("a1")).await.unwrap();
        assert!(offer.is_none());
        assert!(b.is_polite());
        assert_eq!(b.phase(), NegotiationPhase::Stable);
    }

    #[tokio::test]
    async fn role_is_decided_once() {
        let mut a = negotiator("a1");
        a.on_peer_discovered(&PeerId::from("b2")).await.unwrap();
        assert!(
            a.on_peer_discovered(&PeerId::from("b2"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            a.on_peer_discovered(&PeerId::from("z9"))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(a.role(), Some(Role::Impolite));
        assert_eq!(a.snapshot().remote_peer, Some(PeerId::from("b2")));
    }

    #[tokio::test]
    async fn second_offer_is_skipped_while_one_is_outstanding() {
        let mut a = negotiator("a1");
        assert!(a.create_offer().await.unwrap().is_some());
        assert!(a.create_offer().await.unwrap().is_none());
        assert_eq!(a.phase(), NegotiationPhase::AwaitingAnswer);
    }

    #[tokio::test]
    async fn offer_failure_clears_making_offer() {
        let mut a = negotiator("a1");
        a.engine().fail_next(FailPoint::CreateOffer);
        assert!(matches!(
            a.create_offer().await,
            Err(NegotiationError::SdpCreate(_))
        ));
        assert!(!a.making_offer());

        a.engine().fail_next(FailPoint::SetLocal);
        assert!(matches!(
            a.create_offer().await,
            Err(NegotiationError::SdpApply(_))
        ));
        assert!(!a.making_offer());
        assert!(a.create_offer().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn answer_requires_remote_offer() {
        let mut b = negotiator("b2");
        assert_eq!(b.create_answer().await, Err(NegotiationError::NoRemoteOffer));
    }

    #[tokio::test]
    async fn offer_answer_round_trip() {
        let mut a = negotiator("a1");
        let mut b = negotiator("b2");
        let offer = a
            .on_peer_discovered(&PeerId::from("b2"))
            .await
            .unwrap()
            .unwrap();
        b.on_peer_discovered(&PeerId::from("a1")).await.unwrap();

        b.apply_remote_description(offer.clone()).await.unwrap();
        assert_eq!(b.phase(), NegotiationPhase::RemoteOfferPending);
        let answer = b.create_answer().await.unwrap();
        a.apply_remote_description(answer.clone()).await.unwrap();

        assert_eq!(a.phase(), NegotiationPhase::Stable);
        assert_eq!(b.phase(), NegotiationPhase::Stable);
        assert_eq!(a.engine().local_description(), Some(offer.clone()));
        assert_eq!(b.engine().remote_description(), Some(offer));
        assert_eq!(a.engine().remote_description(), Some(answer));
    }

    #[tokio::test]
    async fn glare_keeps_the_impolite_offer() {
        let mut impolite = negotiator("a1");
        let mut polite = negotiator("b2");
        impolite.note_remote_peer(&PeerId::from("b2"));
        polite.note_remote_peer(&PeerId::from("a1"));

        let impolite_offer = impolite.create_offer().await.unwrap().unwrap();
        let polite_offer = polite.create_offer().await.unwrap().unwrap();

        assert_eq!(
            impolite.apply_remote_description(polite_offer).await,
            Err(NegotiationError::Collision)
        );
        assert_eq!(impolite.phase(), NegotiationPhase::AwaitingAnswer);

        polite
            .apply_remote_description(impolite_offer.clone())
            .await
            .unwrap();
        assert_eq!(polite.engine().rollbacks(), 1);
        let answer = polite.create_answer().await.unwrap();
        impolite.apply_remote_description(answer).await.unwrap();

        assert_eq!(impolite.engine().local_description(), Some(impolite_offer.clone()));
        assert_eq!(polite.engine().remote_description(), Some(impolite_offer));
        assert_eq!(impolite.engine().signaling_state(), MockSignalingState::Stable);
        assert_eq!(polite.engine().signaling_state(), MockSignalingState::Stable);
    }

    #[tokio::test]
    async fn failed_rollback_keeps_local_offer() {
        let mut polite = negotiator("b2");
        polite.note_remote_peer(&PeerId::from("a1"));
        polite.create_offer().await.unwrap();
        polite.engine().fail_next(FailPoint::Rollback);
        let result = polite
            .apply_remote_description(SessionDescription::offer("offer:a1:1"))
            .await;
        assert!(matches!(result, Err(NegotiationError::SdpApply(_))));
        assert_eq!(polite.phase(), NegotiationPhase::AwaitingAnswer);
    }

    #[tokio::test]
    async fn candidates_queue_until_remote_description() {
        let mut b = negotiator("b2");
        for n in 1..=3 {
            b.add_ice_candidate(candidate(n)).await.unwrap();
        }
        assert_eq!(b.pending_candidates(), 3);
        assert!(b.engine().applied_candidates().is_empty());

        b.apply_remote_description(SessionDescription::offer("offer:a1:1"))
            .await
            .unwrap();
        assert_eq!(b.pending_candidates(), 0);
        assert_eq!(
            b.engine().applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );

        b.add_ice_candidate(candidate(4)).await.unwrap();
        assert_eq!(b.engine().applied_candidates().len(), 4);
    }

    #[tokio::test]
    async fn candidates_survive_polite_rollback() {
        let mut polite = negotiator("b2");
        polite.note_remote_peer(&PeerId::from("a1"));
        polite.create_offer().await.unwrap();
        polite.add_ice_candidate(candidate(1)).await.unwrap();
        assert_eq!(polite.pending_candidates(), 1);

        polite
            .apply_remote_description(SessionDescription::offer("offer:a1:1"))
            .await
            .unwrap();
        assert_eq!(polite.engine().applied_candidates(), vec![candidate(1)]);
    }

    #[tokio::test]
    async fn rejected_answer_returns_to_stable() {
        let mut a = negotiator("a1");
        a.create_offer().await.unwrap();
        a.engine().fail_next(FailPoint::SetRemote);
        assert!(matches!(
            a.apply_remote_description(SessionDescription::answer("bad"))
                .await,
            Err(NegotiationError::SdpApply(_))
        ));
        assert_eq!(a.phase(), NegotiationPhase::Stable);
        assert!(a.create_offer().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remote_rollback_is_rejected() {
        let mut a = negotiator("a1");
        assert_eq!(
            a.apply_remote_description(SessionDescription::rollback()).await,
            Err(NegotiationError::UnexpectedDescription(SdpKind::Rollback))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let mut a = negotiator("a1");
        a.add_ice_candidate(candidate(1)).await.unwrap();
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(a.phase(), NegotiationPhase::Closed);
        assert_eq!(a.pending_candidates(), 0);
        assert_eq!(a.engine().signaling_state(), MockSignalingState::Closed);
        assert_eq!(a.create_offer().await, Err(NegotiationError::Closed));
    }
}
