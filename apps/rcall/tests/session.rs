mod support;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use rcall_core::media::mock::{MockEngine, MockSignalingState};
use rcall_core::media::SdpKind;
use rcall_core::session::{Session, SessionEvent};
use rcall_core::signaling::{PeerId, SignalingChannel, SignalingConfig, SignalingConnectionState};
use rcall_relay::{RelayState, serve};
use support::{init_tracing, next_event, wait_until};

struct Peer {
    session: Session,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    engine: Arc<MockEngine>,
}

impl Peer {
    fn start(url: &str, id: &str) -> Self {
        let (engine, peer_events) = MockEngine::new(id);
        let engine = Arc::new(engine);
        let config = SignalingConfig::new(url).unwrap();
        let (signaling, signaling_events) =
            SignalingChannel::with_peer_id(config, PeerId::from(id));
        let (session, events) =
            Session::start(Arc::clone(&engine), signaling, signaling_events, peer_events);
        Self {
            session,
            events,
            engine,
        }
    }

    async fn wait_for_media(&mut self) {
        loop {
            match next_event(&mut self.events).await {
                SessionEvent::MediaConnected => return,
                SessionEvent::NegotiationFailed(err) => panic!("negotiation failed: {err}"),
                _ => {}
            }
        }
    }
}

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, RelayState::new(2)));
    format!("ws://{addr}/")
}

async fn connected_pair() -> (Peer, Peer) {
    let url = start_relay().await;
    let mut polite = Peer::start(&url, "b2");
    let mut impolite = Peer::start(&url, "a1");
    polite.session.join("r1");
    impolite.session.join("r1");
    polite.wait_for_media().await;
    impolite.wait_for_media().await;
    (polite, impolite)
}

#[test_timeout::tokio_timeout_test(15)]
async fn two_peers_negotiate_through_the_relay() {
    init_tracing();
    let (polite, impolite) = connected_pair().await;

    let offer = impolite.engine.local_description().unwrap();
    assert_eq!(offer.kind, SdpKind::Offer);
    assert!(offer.sdp.starts_with("offer:a1"), "{}", offer.sdp);
    assert_eq!(polite.engine.remote_description(), Some(offer));

    let answer = polite.engine.local_description().unwrap();
    assert_eq!(answer.kind, SdpKind::Answer);
    assert_eq!(impolite.engine.remote_description(), Some(answer));

    assert_eq!(polite.engine.signaling_state(), MockSignalingState::Stable);
    assert_eq!(impolite.engine.signaling_state(), MockSignalingState::Stable);
    assert_eq!(polite.engine.rollbacks(), 0);

    let from_polite = polite.engine.host_candidate();
    let from_impolite = impolite.engine.host_candidate();
    wait_until(|| impolite.engine.applied_candidates().contains(&from_polite)).await;
    wait_until(|| polite.engine.applied_candidates().contains(&from_impolite)).await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn simultaneous_renegotiation_resolves_by_role() {
    init_tracing();
    let (mut polite, mut impolite) = connected_pair().await;

    assert!(polite.session.renegotiate());
    assert!(impolite.session.renegotiate());

    wait_until(|| polite.engine.rollbacks() == 1).await;
    wait_until(|| {
        impolite.engine.signaling_state() == MockSignalingState::Stable
            && impolite.engine.remote_description() == polite.engine.local_description()
    })
    .await;

    let offer = impolite.engine.local_description().unwrap();
    assert_eq!(offer.kind, SdpKind::Offer);
    assert!(offer.sdp.starts_with("offer:a1"), "{}", offer.sdp);
    assert_eq!(polite.engine.remote_description(), Some(offer));
    assert_eq!(polite.engine.signaling_state(), MockSignalingState::Stable);
    assert_eq!(polite.engine.rollbacks(), 1);

    while let Ok(event) = polite.events.try_recv() {
        assert!(!matches!(event, SessionEvent::NegotiationFailed(_)), "{event:?}");
    }
    while let Ok(event) = impolite.events.try_recv() {
        assert!(!matches!(event, SessionEvent::NegotiationFailed(_)), "{event:?}");
    }
}

#[test_timeout::tokio_timeout_test(15)]
async fn hang_up_releases_engine_and_leaves_room() {
    init_tracing();
    let (polite, impolite) = connected_pair().await;

    impolite.session.hang_up().await;
    assert_eq!(impolite.engine.signaling_state(), MockSignalingState::Closed);
    assert_eq!(
        impolite.session.signaling_state(),
        SignalingConnectionState::Idle
    );
    assert!(impolite.session.negotiation().snapshot().await.is_none());

    assert_eq!(polite.engine.signaling_state(), MockSignalingState::Stable);
}
