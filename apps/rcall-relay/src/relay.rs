use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Policy violation: sent when a room is full.
const ROOM_FULL_CLOSE_CODE: u16 = 1008;
/// Normal closure: the old link of a peer that joined again.
const REPLACED_CLOSE_CODE: u16 = 1000;

#[derive(Clone)]
struct PeerLink {
    connection: u64,
    tx: mpsc::UnboundedSender<Message>,
}

/// Rooms and the live link of each peer in them.
#[derive(Clone)]
pub struct RelayState {
    /// Map of room -> (peer_id -> PeerLink)
    rooms: Arc<DashMap<String, DashMap<String, PeerLink>>>,
    capacity: usize,
    next_connection: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    room: String,
    peer: String,
}

enum Admission {
    Admitted { others: Vec<(String, PeerLink)> },
    RoomFull,
}

impl RelayState {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn peers_in(&self, room: &str) -> usize {
        self.rooms.get(room).map(|peers| peers.len()).unwrap_or(0)
    }

    fn admit(&self, room: &str, peer_id: &str, link: PeerLink) -> Admission {
        let peers = self
            .rooms
            .entry(room.to_string())
            .or_insert_with(DashMap::new);
        // A peer reconnecting under the same id replaces its old link.
        if !peers.contains_key(peer_id) && peers.len() >= self.capacity {
            return Admission::RoomFull;
        }
        if let Some(replaced) = peers.insert(peer_id.to_string(), link) {
            debug!(
                "peer {} rejoined room {}; closing connection {}",
                peer_id, room, replaced.connection
            );
            let _ = replaced.tx.send(Message::Close(Some(CloseFrame {
                code: REPLACED_CLOSE_CODE,
                reason: Cow::from("replaced"),
            })));
        }
        let others = peers
            .iter()
            .filter(|entry| entry.key() != peer_id)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Admission::Admitted { others }
    }

    /// Removes the peer unless a newer connection already replaced it.
    fn release(&self, room: &str, peer_id: &str, connection: u64) {
        let mut remove_room = false;
        if let Some(peers) = self.rooms.get(room) {
            peers.remove_if(peer_id, |_, link| link.connection == connection);
            remove_room = peers.is_empty();
        }
        if remove_room {
            self.rooms.remove_if(room, |_, peers| peers.is_empty());
        }
    }

    fn forward(&self, room: &str, from: &str, message: Message) -> usize {
        let Some(peers) = self.rooms.get(room) else {
            return 0;
        };
        let mut delivered = 0;
        for entry in peers.iter().filter(|entry| entry.key() != from) {
            if entry.value().tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<JoinParams>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

fn peer_joined(room: &str, peer_id: &str) -> Message {
    Message::Text(
        serde_json::json!({ "type": "peer-joined", "room": room, "peerId": peer_id }).to_string(),
    )
}

async fn handle_socket(socket: WebSocket, params: JoinParams, state: RelayState) {
    let JoinParams { room, peer } = params;
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.next_connection.fetch_add(1, Ordering::Relaxed);

    let others = match state.admit(
        &room,
        &peer,
        PeerLink {
            connection,
            tx: tx.clone(),
        },
    ) {
        Admission::Admitted { others } => others,
        Admission::RoomFull => {
            warn!("room {} full; rejecting peer {}", room, peer);
            let error = serde_json::json!({ "type": "error", "room": room, "payload": "room full" });
            let _ = sender.send(Message::Text(error.to_string())).await;
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: ROOM_FULL_CLOSE_CODE,
                    reason: Cow::from("room full"),
                })))
                .await;
            return;
        }
    };
    info!("peer {} joined room {} ({} other)", peer, room, others.len());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    for (other_id, other) in &others {
        let _ = tx.send(peer_joined(&room, other_id));
        let _ = other.tx.send(peer_joined(&room, &peer));
    }
    drop(others);
    drop(tx);

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                debug!("websocket error from peer {}: {}", peer, err);
                break;
            }
        };
        match message {
            Message::Text(_) | Message::Binary(_) => {
                let delivered = state.forward(&room, &peer, message);
                debug!("relayed frame from {} to {} peer(s)", peer, delivered);
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.release(&room, &peer, connection);
    writer.abort();
    info!("peer {} left room {}", peer, room);
}
