#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep, timeout};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use rcall_core::signaling::SignalingEvent;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// What the fake relay does with one accepted connection.
#[derive(Debug, Clone, Copy)]
pub enum ConnectionPlan {
    Stay,
    CloseWith(u16),
    /// Drop the socket without a close frame.
    Abort,
}

struct Shared {
    connections: AtomicUsize,
    queries: Mutex<Vec<HashMap<String, String>>>,
    received: Mutex<Vec<String>>,
    plans: Mutex<VecDeque<ConnectionPlan>>,
    outbound: broadcast::Sender<String>,
}

/// Scriptable WebSocket endpoint that records what clients send.
#[derive(Clone)]
pub struct FakeRelay {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
}

impl FakeRelay {
    pub async fn start(plans: Vec<ConnectionPlan>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake relay");
        Self::serve(listener, plans)
    }

    pub async fn start_on(addr: SocketAddr, plans: Vec<ConnectionPlan>) -> Self {
        let listener = TcpListener::bind(addr).await.expect("rebind fake relay");
        Self::serve(listener, plans)
    }

    fn serve(listener: TcpListener, plans: Vec<ConnectionPlan>) -> Self {
        let addr = listener.local_addr().expect("fake relay addr");
        let (outbound, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            connections: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            plans: Mutex::new(plans.into()),
            outbound,
        });
        let app = Router::new()
            .route("/", get(upgrade))
            .with_state(Arc::clone(&shared));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, shared }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<HashMap<String, String>> {
        self.shared.queries.lock().clone()
    }

    pub fn received(&self) -> Vec<String> {
        self.shared.received.lock().clone()
    }

    /// Sends a text frame to every connection currently in `Stay`.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.shared.outbound.send(text.into());
    }

    pub async fn wait_for_received(&self, count: usize) -> Vec<String> {
        wait_until(|| self.received().len() >= count).await;
        self.received()
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(shared): State<Arc<Shared>>,
) -> Response {
    ws.on_upgrade(move |socket| handle(socket, query, shared))
}

async fn handle(mut socket: WebSocket, query: HashMap<String, String>, shared: Arc<Shared>) {
    shared.queries.lock().push(query);
    let plan = shared
        .plans
        .lock()
        .pop_front()
        .unwrap_or(ConnectionPlan::Stay);
    // Subscribe before counting so a test that saw the connection can push.
    let mut outbound = shared.outbound.subscribe();
    shared.connections.fetch_add(1, Ordering::SeqCst);

    match plan {
        ConnectionPlan::Abort => {}
        ConnectionPlan::CloseWith(code) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: "scripted".into(),
                })))
                .await;
        }
        ConnectionPlan::Stay => loop {
            tokio::select! {
                frame = socket.recv() => match frame {
                    Some(Ok(Message::Text(text))) => shared.received.lock().push(text),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                pushed = outbound.recv() => match pushed {
                    Ok(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        },
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn next_event<T>(events: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Asserts nothing arrives for `quiet`.
pub async fn assert_no_event<T: std::fmt::Debug>(
    events: &mut mpsc::UnboundedReceiver<T>,
    quiet: Duration,
) {
    if let Ok(Some(event)) = timeout(quiet, events.recv()).await {
        panic!("unexpected event {event:?}");
    }
}

pub async fn expect_open(events: &mut mpsc::UnboundedReceiver<SignalingEvent>) {
    match next_event(events).await {
        SignalingEvent::Open { .. } => {}
        other => panic!("expected open, got {other:?}"),
    }
}
