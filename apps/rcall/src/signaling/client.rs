use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::envelope::{self, Envelope, EnvelopeBody};
use super::{PeerId, RoomId, SignalingConnectionState, SignalingEvent, TransportError};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const NORMAL_CLOSURE: u16 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static RUNTIME: Lazy<Runtime> = Lazy::new(|| Runtime::new().expect("tokio runtime"));

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub base_url: Url,
    pub reconnect_delay: Duration,
}

impl SignalingConfig {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let base_url =
            Url::parse(base_url).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        match base_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme {other}"
                )));
            }
        }
        Ok(Self {
            base_url,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        })
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// `base?room=<room>&peer=<peer>`
    pub fn room_url(&self, room: &RoomId, peer: &PeerId) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("room", room.as_str())
            .append_pair("peer", peer.as_str());
        url
    }
}

/// Reconnecting WebSocket link to the relay for one room at a time.
///
/// Inbound envelopes are delivered as [`SignalingEvent`]s on the receiver
/// returned by [`SignalingChannel::new`]. Cloning shares the same link.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

struct Inner {
    config: SignalingConfig,
    peer_id: PeerId,
    events: mpsc::UnboundedSender<SignalingEvent>,
    connecting: AtomicBool,
    state: Mutex<ChannelState>,
    runtime: Handle,
}

struct ChannelState {
    phase: SignalingConnectionState,
    desired_room: Option<RoomId>,
    // Bumped by every connect/leave so tasks of a superseded link go quiet.
    generation: u64,
    link: Option<Link>,
    reconnect: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Link {
    fn close(self, reason: &'static str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }
}

enum LinkEnd {
    Remote { code: u16, reason: String },
    Failed(String),
}

impl SignalingChannel {
    pub fn new(config: SignalingConfig) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        Self::with_peer_id(config, PeerId::random())
    }

    pub fn with_peer_id(
        config: SignalingConfig,
        peer_id: PeerId,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let runtime = Handle::try_current().unwrap_or_else(|_| RUNTIME.handle().clone());
        let inner = Arc::new(Inner {
            config,
            peer_id,
            events,
            connecting: AtomicBool::new(false),
            state: Mutex::new(ChannelState {
                phase: SignalingConnectionState::Idle,
                desired_room: None,
                generation: 0,
                link: None,
                reconnect: None,
                tasks: Vec::new(),
            }),
            runtime,
        });
        (Self { inner }, receiver)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn state(&self) -> SignalingConnectionState {
        self.inner.state.lock().phase.clone()
    }

    pub fn room(&self) -> Option<RoomId> {
        self.inner.state.lock().desired_room.clone()
    }

    /// Opens a link for `room`, replacing any existing one. A call made while
    /// another attempt is still in flight is ignored.
    pub fn connect(&self, room: impl Into<RoomId>) {
        Inner::connect(&self.inner, room.into());
    }

    /// Stamps `room` and `from` and sends. Returns `false` when there is no
    /// open link; the envelope is dropped, not buffered.
    pub fn send(&self, body: EnvelopeBody) -> bool {
        let state = self.inner.state.lock();
        let (Some(link), SignalingConnectionState::Open(room)) = (&state.link, &state.phase)
        else {
            tracing::warn!(
                target = "rcall::signaling",
                kind = body.kind(),
                state = ?state.phase,
                "signaling link not open; dropping outbound envelope"
            );
            return false;
        };
        let envelope = Envelope::stamped(room.clone(), self.inner.peer_id.clone(), body);
        let text = envelope::encode_text(&envelope);
        tracing::trace!(
            target = "rcall::signaling",
            kind = envelope.body.kind(),
            room = %room,
            bytes = text.len(),
            "sending envelope"
        );
        if link.outbound.send(Message::Text(text)).is_err() {
            tracing::warn!(
                target = "rcall::signaling",
                "signaling writer already stopped; dropping outbound envelope"
            );
            return false;
        }
        true
    }

    /// Cancels any pending reconnect, closes the link normally and forgets
    /// the room. Safe to call repeatedly.
    pub fn leave(&self) {
        let mut state = self.inner.state.lock();
        if let Some(reconnect) = state.reconnect.take() {
            reconnect.abort();
        }
        state.generation += 1;
        if let Some(link) = state.link.take() {
            link.close("User left");
        }
        if let Some(room) = state.desired_room.take() {
            tracing::info!(target = "rcall::signaling", room = %room, "left room");
        }
        state.phase = SignalingConnectionState::Idle;
        self.inner.connecting.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    fn connect(self: &Arc<Self>, room: RoomId) {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(
                target = "rcall::signaling",
                room = %room,
                "connection attempt already in progress; ignoring connect"
            );
            return;
        }

        let url = self.config.room_url(&room, &self.peer_id);
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            if let Some(reconnect) = state.reconnect.take() {
                reconnect.abort();
            }
            if let Some(link) = state.link.take() {
                link.close("Changing room");
            }
            state.tasks.retain(|task| !task.is_finished());
            state.desired_room = Some(room.clone());
            state.phase = SignalingConnectionState::Connecting;
            state.generation
        };

        tracing::debug!(
            target = "rcall::signaling",
            url = %url,
            generation,
            "connecting to signaling relay"
        );

        let weak = Arc::downgrade(self);
        let attempt = self.runtime.spawn(async move {
            let result = connect_async(url.as_str()).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok((stream, _response)) => inner.on_open(generation, room, stream),
                Err(err) => inner.on_failure(generation, format!("connect failed: {err}")),
            }
        });
        self.state.lock().tasks.push(attempt);
    }

    fn on_open(self: &Arc<Self>, generation: u64, room: RoomId, stream: WsStream) {
        let (sink, stream) = stream.split();
        let mut state = self.state.lock();
        if state.generation != generation {
            drop(state);
            tracing::debug!(
                target = "rcall::signaling",
                generation,
                "discarding superseded signaling connection"
            );
            self.runtime.spawn(close_stale(sink));
            return;
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer = self.runtime.spawn(write_loop(sink, outbound_rx));
        let reader = self
            .runtime
            .spawn(read_loop(Arc::downgrade(self), generation, stream));
        state.tasks.push(writer);
        state.tasks.push(reader);
        state.link = Some(Link {
            generation,
            outbound,
        });
        state.phase = SignalingConnectionState::Open(room.clone());
        if let Some(reconnect) = state.reconnect.take() {
            reconnect.abort();
        }
        self.connecting.store(false, Ordering::SeqCst);
        drop(state);

        tracing::info!(
            target = "rcall::signaling",
            room = %room,
            peer_id = %self.peer_id,
            "signaling link open"
        );
        self.emit(SignalingEvent::Open { room });
    }

    fn on_link_end(self: &Arc<Self>, generation: u64, end: LinkEnd) {
        {
            let mut state = self.state.lock();
            let current = state
                .link
                .as_ref()
                .is_some_and(|link| link.generation == generation);
            if !current {
                return;
            }
            state.link = None;
            if let LinkEnd::Remote { code, reason } = &end {
                if *code == NORMAL_CLOSURE {
                    state.phase = SignalingConnectionState::Closed;
                    drop(state);
                    tracing::info!(
                        target = "rcall::signaling",
                        code,
                        reason = %reason,
                        "relay closed signaling link normally"
                    );
                    self.emit(SignalingEvent::Closed {
                        reason: reason.clone(),
                    });
                    return;
                }
            }
        }

        let reason = match end {
            LinkEnd::Remote { code, reason } => format!("closed with code {code}: {reason}"),
            LinkEnd::Failed(reason) => reason,
        };
        self.emit(SignalingEvent::Closed {
            reason: reason.clone(),
        });
        self.on_failure(generation, reason);
    }

    fn on_failure(self: &Arc<Self>, generation: u64, reason: String) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.link = None;
        self.connecting.store(false, Ordering::SeqCst);

        if state.desired_room.is_none() {
            state.phase = SignalingConnectionState::Idle;
            return;
        }
        state.phase = SignalingConnectionState::ReconnectPending;
        if state
            .reconnect
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            tracing::debug!(
                target = "rcall::signaling",
                reason = %reason,
                "signaling failure; reconnect already scheduled"
            );
            return;
        }

        let delay = self.config.reconnect_delay;
        tracing::warn!(
            target = "rcall::signaling",
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            "signaling link failed; scheduling reconnect"
        );
        let weak = Arc::downgrade(self);
        state.reconnect = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let room = {
                let mut state = inner.state.lock();
                state.reconnect = None;
                if state.link.is_some() {
                    return;
                }
                state.desired_room.clone()
            };
            if let Some(room) = room {
                tracing::debug!(target = "rcall::signaling", room = %room, "reconnecting");
                Inner::connect(&inner, room);
            }
        }));
    }

    fn dispatch(&self, bytes: &[u8]) {
        let envelope = match envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    target = "rcall::signaling",
                    error = %err,
                    "dropping malformed envelope"
                );
                return;
            }
        };
        if envelope.from.as_ref() == Some(&self.peer_id) {
            tracing::trace!(target = "rcall::signaling", "ignoring self-originated envelope");
            return;
        }

        let kind = envelope.body.kind();
        let event = match (envelope.body, envelope.from) {
            (EnvelopeBody::PeerJoined { peer_id }, _) => {
                if peer_id == self.peer_id {
                    return;
                }
                SignalingEvent::PeerJoined { peer_id }
            }
            (EnvelopeBody::Error { payload }, _) => {
                tracing::warn!(
                    target = "rcall::signaling",
                    payload = %payload,
                    "relay reported an error"
                );
                SignalingEvent::ServerError { payload }
            }
            (_, None) => {
                tracing::warn!(
                    target = "rcall::signaling",
                    kind,
                    "dropping envelope without sender"
                );
                return;
            }
            (EnvelopeBody::Offer { sdp }, Some(from)) => SignalingEvent::Offer { from, sdp },
            (EnvelopeBody::Answer { sdp }, Some(from)) => SignalingEvent::Answer { from, sdp },
            (EnvelopeBody::Ice { candidate }, Some(from)) => SignalingEvent::Ice { from, candidate },
        };
        tracing::trace!(target = "rcall::signaling", kind, "received envelope");
        self.emit(event);
    }

    fn emit(&self, event: SignalingEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(
                target = "rcall::signaling",
                "signaling event receiver dropped"
            );
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(reconnect) = state.reconnect.take() {
            reconnect.abort();
        }
        if let Some(link) = state.link.take() {
            link.close("User left");
        }
        for task in state.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            log_ws_error("signaling write failed", &err);
            break;
        }
        if closing {
            break;
        }
    }
}

async fn read_loop(weak: Weak<Inner>, generation: u64, mut stream: SplitStream<WsStream>) {
    let end = loop {
        let next = stream.next().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match next {
            Some(Ok(Message::Text(text))) => inner.dispatch(text.as_bytes()),
            Some(Ok(Message::Binary(bytes))) => inner.dispatch(&bytes),
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                    .unwrap_or((1005, String::new()));
                break LinkEnd::Remote { code, reason };
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                log_ws_error("signaling read failed", &err);
                break LinkEnd::Failed(err.to_string());
            }
            None => break LinkEnd::Failed("connection closed without close frame".into()),
        }
    };
    if let Some(inner) = weak.upgrade() {
        inner.on_link_end(generation, end);
    }
}

async fn close_stale(mut sink: SplitSink<WsStream, Message>) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "Changing room".into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

fn log_ws_error(context: &'static str, err: &WsError) {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            tracing::debug!(target = "rcall::signaling", error = %err, "{context}");
        }
        _ => tracing::warn!(target = "rcall::signaling", error = %err, "{context}"),
    }
}
