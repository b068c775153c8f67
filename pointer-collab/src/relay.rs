//! WebSocket relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!             ├── Room ("document-{identity}") ── Yrs Doc ── broadcast fan-out
//! Session B ──┘                                       │
//!                                          ┌──────────┼───────────┐
//!                                          ▼          ▼           ▼
//!                                      Session A  Session B   Session C
//! ```
//!
//! Each room keeps the authoritative document state so a late joiner can
//! catch up from the handshake alone. Frames are never echoed back to the
//! peer that sent them. Empty rooms are dropped.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, Transact};

use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1999".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Document room: authoritative Yrs doc + fan-out channel.
struct RelayRoom {
    doc: yrs::Doc,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: HashMap<Uuid, PeerInfo>,
}

impl RelayRoom {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            doc: yrs::Doc::new(),
            sender,
            peers: HashMap::new(),
        }
    }

    fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.sender.send(encoded).unwrap_or(0))
    }

    /// Merge an update into the authoritative state.
    fn apply(&self, payload: &[u8]) -> bool {
        match yrs::Update::decode_v1(payload) {
            Ok(update) => {
                let mut txn = self.doc.transact_mut();
                txn.apply_update(update).is_ok()
            }
            Err(_) => false,
        }
    }
}

type Rooms = Arc<RwLock<HashMap<String, RelayRoom>>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let capacity = self.config.broadcast_capacity;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats, capacity).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Serve one WebSocket connection until it closes.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
    capacity: usize,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut peer_id: Option<Uuid> = None;
    let mut room_name: Option<String> = None;
    let mut fan_in: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

    let outcome: Result<(), RelayError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok::<(), RelayError>(());
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                    };

                    let bytes: Vec<u8> = data.into();
                    let sync_msg = match SyncMessage::decode(&bytes) {
                        Ok(m) => m,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            continue;
                        }
                    };
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += bytes.len() as u64;
                    }

                    match sync_msg.msg_type {
                        MessageType::Join => {
                            let info = sync_msg
                                .peer_info()
                                .unwrap_or_else(|_| PeerInfo::with_id(sync_msg.peer_id, "Anonymous"));
                            let mut rooms_w = rooms.write().await;
                            let room = rooms_w
                                .entry(sync_msg.room.clone())
                                .or_insert_with(|| RelayRoom::new(capacity));
                            room.peers.insert(info.peer_id, info.clone());
                            fan_in = Some(room.sender.subscribe());
                            peer_id = Some(info.peer_id);
                            room_name = Some(sync_msg.room.clone());
                            let room_count = rooms_w.len();
                            drop(rooms_w);

                            stats.write().await.active_rooms = room_count;
                            log::info!("Peer {} ({}) joined room {}", info.name, info.peer_id, sync_msg.room);
                        }

                        MessageType::SyncStep1 => {
                            let Some(name) = room_name.as_ref() else { continue };
                            let replies = {
                                let rooms_r = rooms.read().await;
                                rooms_r.get(name).and_then(|room| {
                                    let remote_sv = yrs::StateVector::decode_v1(&sync_msg.payload).ok()?;
                                    let txn = room.doc.transact();
                                    Some((txn.encode_diff_v1(&remote_sv), txn.state_vector().encode_v1()))
                                })
                            };
                            if let Some((diff, server_sv)) = replies {
                                let step2 = SyncMessage::sync_step2(Uuid::nil(), name, diff);
                                ws_sender.send(Message::Binary(step2.encode()?.into())).await?;
                                let step1 = SyncMessage::sync_step1(Uuid::nil(), name, server_sv);
                                ws_sender.send(Message::Binary(step1.encode()?.into())).await?;
                            } else {
                                log::warn!("Bad state vector from {addr}");
                            }
                        }

                        MessageType::SyncStep2 | MessageType::Delta => {
                            let Some(name) = room_name.as_ref() else { continue };
                            let rooms_r = rooms.read().await;
                            if let Some(room) = rooms_r.get(name) {
                                if room.apply(&sync_msg.payload) {
                                    let delta = SyncMessage::delta(
                                        sync_msg.peer_id,
                                        name,
                                        sync_msg.clock,
                                        sync_msg.payload,
                                    );
                                    room.broadcast(&delta)?;
                                } else {
                                    log::warn!("Dropping unmergeable update from {addr}");
                                }
                            }
                        }

                        MessageType::Awareness => {
                            let Some(name) = room_name.as_ref() else { continue };
                            match AwarenessMessage::decode(&sync_msg.payload) {
                                Ok(AwarenessMessage::Join { user_name, .. }) => {
                                    log::debug!("Presence: {user_name} announced in room {name}");
                                }
                                Ok(AwarenessMessage::Leave { user_id }) => {
                                    log::info!("Presence: {user_id} left room {name}");
                                }
                                Ok(AwarenessMessage::Cursor { .. }) => {
                                    log::trace!("Presence: cursor update in room {name}");
                                }
                                Err(e) => log::debug!("Opaque awareness payload in room {name}: {e}"),
                            }
                            let rooms_r = rooms.read().await;
                            if let Some(room) = rooms_r.get(name) {
                                room.broadcast(&sync_msg)?;
                            }
                        }

                        MessageType::Leave => {
                            log::debug!("Peer {} leaving room {:?}", sync_msg.peer_id, room_name);
                        }

                        MessageType::Ping => {
                            let pong = SyncMessage::pong(Uuid::nil());
                            ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                        }

                        MessageType::Pong => {}
                    }
                }

                msg = async {
                    match fan_in.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Don't echo back to sender
                            if let Ok(decoded) = SyncMessage::decode(&data) {
                                if Some(decoded.peer_id) == peer_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {peer_id:?} lagged by {n} messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }
    .await;

    // Cleanup: remove peer, drop empty rooms
    let mut rooms_w = rooms.write().await;
    if let (Some(pid), Some(name)) = (peer_id, room_name) {
        let empty = match rooms_w.get_mut(&name) {
            Some(room) => {
                room.peers.remove(&pid);
                room.peers.is_empty()
            }
            None => false,
        };
        if empty {
            rooms_w.remove(&name);
            log::info!("Room {name} removed (empty)");
        }
    }
    let mut s = stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    s.active_rooms = rooms_w.len();

    outcome
}
