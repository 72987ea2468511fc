use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::{
    NegotiationCommand, NegotiationError, NegotiationEvent, NegotiationSnapshot, Negotiator,
};
use crate::media::{MediaEngine, SessionDescription};
use crate::signaling::PeerId;

type Reply = oneshot::Sender<Result<Option<SessionDescription>, NegotiationError>>;

enum Job {
    Run {
        command: NegotiationCommand,
        reply: Option<Reply>,
    },
    Snapshot(oneshot::Sender<NegotiationSnapshot>),
}

/// Submits work to the negotiation worker. Cloning shares the same queue.
#[derive(Clone)]
pub struct NegotiationHandle {
    jobs: mpsc::UnboundedSender<Job>,
}

/// Starts the single task that owns the [`Negotiator`]. Commands run one at
/// a time in submission order; produced descriptions and failures come out
/// as [`NegotiationEvent`]s. Must be called from within a Tokio runtime.
pub fn spawn_worker<E: MediaEngine>(
    engine: Arc<E>,
    local_id: PeerId,
) -> (NegotiationHandle, mpsc::UnboundedReceiver<NegotiationEvent>) {
    let (jobs, job_rx) = mpsc::unbounded_channel();
    let (events, event_rx) = mpsc::unbounded_channel();
    let negotiator = Negotiator::new(engine, local_id);
    tokio::spawn(run(negotiator, job_rx, events));
    (NegotiationHandle { jobs }, event_rx)
}

impl NegotiationHandle {
    /// Queues `command` without waiting. Returns `false` once the worker has
    /// stopped.
    pub fn submit(&self, command: NegotiationCommand) -> bool {
        self.jobs
            .send(Job::Run {
                command,
                reply: None,
            })
            .is_ok()
    }

    /// Queues `command` and waits for its result.
    pub async fn execute(
        &self,
        command: NegotiationCommand,
    ) -> Result<Option<SessionDescription>, NegotiationError> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(Job::Run {
                command,
                reply: Some(reply),
            })
            .map_err(|_| NegotiationError::WorkerStopped)?;
        response
            .await
            .map_err(|_| NegotiationError::WorkerStopped)?
    }

    /// Closes after everything queued before it has run.
    pub async fn close(&self) -> Result<(), NegotiationError> {
        match self.execute(NegotiationCommand::Close).await {
            Ok(_) | Err(NegotiationError::WorkerStopped) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn snapshot(&self) -> Option<NegotiationSnapshot> {
        let (reply, response) = oneshot::channel();
        self.jobs.send(Job::Snapshot(reply)).ok()?;
        response.await.ok()
    }
}

async fn run<E: MediaEngine>(
    mut negotiator: Negotiator<E>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    events: mpsc::UnboundedSender<NegotiationEvent>,
) {
    while let Some(job) = jobs.recv().await {
        let (command, reply) = match job {
            Job::Snapshot(reply) => {
                let _ = reply.send(negotiator.snapshot());
                continue;
            }
            Job::Run { command, reply } => (command, reply),
        };

        let operation = command.name();
        let closing = command == NegotiationCommand::Close;
        tracing::trace!(target = "rcall::negotiation", operation, "running command");
        let result = execute(&mut negotiator, command).await;

        match &result {
            Ok(Some(desc)) => {
                let _ = events.send(NegotiationEvent::LocalDescription(desc.clone()));
            }
            Ok(None) => {}
            Err(error) => {
                if error.is_collision() {
                    tracing::debug!(target = "rcall::negotiation", operation, "collision");
                } else {
                    tracing::warn!(
                        target = "rcall::negotiation",
                        operation,
                        error = %error,
                        "negotiation step failed"
                    );
                }
                let _ = events.send(NegotiationEvent::Failed {
                    operation,
                    error: error.clone(),
                });
            }
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        if closing {
            let _ = events.send(NegotiationEvent::Closed);
            break;
        }
    }
    // Release the engine even when every handle was dropped without a close.
    let _ = negotiator.close().await;
    tracing::debug!(target = "rcall::negotiation", "negotiation worker stopped");
}

async fn execute<E: MediaEngine>(
    negotiator: &mut Negotiator<E>,
    command: NegotiationCommand,
) -> Result<Option<SessionDescription>, NegotiationError> {
    match command {
        NegotiationCommand::PeerDiscovered(remote) => negotiator.on_peer_discovered(&remote).await,
        NegotiationCommand::CreateOffer => negotiator.create_offer().await,
        NegotiationCommand::RemoteOffer { from, sdp } => {
            negotiator.note_remote_peer(&from);
            negotiator
                .apply_remote_description(SessionDescription::offer(sdp))
                .await?;
            negotiator.create_answer().await.map(Some)
        }
        NegotiationCommand::RemoteAnswer { sdp } => {
            negotiator
                .apply_remote_description(SessionDescription::answer(sdp))
                .await?;
            Ok(None)
        }
        NegotiationCommand::RemoteCandidate(candidate) => {
            negotiator.add_ice_candidate(candidate).await?;
            Ok(None)
        }
        NegotiationCommand::Close => {
            negotiator.close().await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockEngine;
    use crate::media::SdpKind;
    use crate::negotiation::{NegotiationPhase, Role};
    use crate::signaling::IceCandidateDescriptor;

    #[tokio::test]
    async fn commands_run_in_submission_order() {
        let (engine, _pc_events) = MockEngine::new("b2");
        let engine = Arc::new(engine);
        let (handle, mut events) = spawn_worker(Arc::clone(&engine), PeerId::from("b2"));

        let candidate = IceCandidateDescriptor::new("candidate:1", Some("0".into()), 0);
        assert!(handle.submit(NegotiationCommand::RemoteCandidate(candidate.clone())));
        assert!(handle.submit(NegotiationCommand::RemoteOffer {
            from: PeerId::from("a1"),
            sdp: "offer:a1:1".into(),
        }));

        let event = events.recv().await.unwrap();
        let NegotiationEvent::LocalDescription(answer) = event else {
            panic!("expected local answer, got {event:?}");
        };
        assert_eq!(answer.kind, SdpKind::Answer);
        assert_eq!(engine.applied_candidates(), vec![candidate]);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, NegotiationPhase::Stable);
        assert_eq!(snapshot.role, Some(Role::Polite));
    }

    #[tokio::test]
    async fn collision_is_reported_as_event() {
        let (engine, _pc_events) = MockEngine::new("a1");
        let (handle, mut events) = spawn_worker(Arc::new(engine), PeerId::from("a1"));

        let offer = handle
            .execute(NegotiationCommand::PeerDiscovered(PeerId::from("b2")))
            .await
            .unwrap();
        assert!(offer.is_some());
        assert!(matches!(
            events.recv().await,
            Some(NegotiationEvent::LocalDescription(_))
        ));

        let result = handle
            .execute(NegotiationCommand::RemoteOffer {
                from: PeerId::from("b2"),
                sdp: "offer:b2:1".into(),
            })
            .await;
        assert_eq!(result, Err(NegotiationError::Collision));
        assert_eq!(
            events.recv().await,
            Some(NegotiationEvent::Failed {
                operation: "remote_offer",
                error: NegotiationError::Collision,
            })
        );
    }

    #[tokio::test]
    async fn close_drains_queue_then_stops() {
        let (engine, _pc_events) = MockEngine::new("a1");
        let (handle, mut events) = spawn_worker(Arc::new(engine), PeerId::from("a1"));

        handle.submit(NegotiationCommand::CreateOffer);
        handle.close().await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(NegotiationEvent::LocalDescription(_))
        ));
        assert_eq!(events.recv().await, Some(NegotiationEvent::Closed));
        assert_eq!(events.recv().await, None);
        assert!(!handle.submit(NegotiationCommand::CreateOffer));
        assert_eq!(
            handle.execute(NegotiationCommand::CreateOffer).await,
            Err(NegotiationError::WorkerStopped)
        );
        handle.close().await.unwrap();
    }
}
