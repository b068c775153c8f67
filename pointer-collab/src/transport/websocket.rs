//! WebSocket transport to the replication server.
//!
//! Provides:
//! - Connection lifecycle (connect, graceful disconnect)
//! - Two-way state exchange on connect, incremental deltas afterwards
//! - Awareness (presence) frames
//! - Offline queue for updates produced while disconnected

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pointer_core::{DocumentIdentity, ReplicatedDocument};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{ConnectionStatus, Transport, TransportError, TransportEvent, TransportFactory};
use crate::config::SessionConfig;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};

/// Offline queue for updates made while disconnected.
///
/// Queued deltas are replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedDelta { clock, payload });
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|d| (d.clock, d.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.payload.len()).sum()
    }
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// Transport speaking the binary sync protocol over a WebSocket.
pub struct WebSocketTransport {
    peer_info: PeerInfo,
    room: String,
    server_url: String,
    document: Arc<ReplicatedDocument>,
    state: Arc<RwLock<ConnectionStatus>>,
    clock: AtomicU64,
    /// Bumped on every connect/disconnect so stale reader tasks stay quiet.
    generation: Arc<AtomicU64>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Arc<RwLock<Option<mpsc::Sender<Outgoing>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    channel_capacity: usize,
}

impl WebSocketTransport {
    pub fn new(
        peer_info: PeerInfo,
        room: impl Into<String>,
        document: Arc<ReplicatedDocument>,
        config: &SessionConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        Self {
            peer_info,
            room: room.into(),
            server_url: config.server_url.clone(),
            document,
            state: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            clock: AtomicU64::new(0),
            generation: Arc::new(AtomicU64::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(config.offline_queue_capacity))),
            outgoing_tx: Arc::new(RwLock::new(None)),
            reader: Mutex::new(None),
            event_tx,
            event_rx: Some(event_rx),
            channel_capacity: config.channel_capacity,
        }
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.room)
    }

    pub async fn connection_state(&self) -> ConnectionStatus {
        *self.state.read().await
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn send_frame(&self, msg: SyncMessage) -> Result<(), TransportError> {
        let encoded = msg.encode()?;
        let guard = self.outgoing_tx.read().await;
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(Outgoing::Frame(encoded))
            .await
            .map_err(|_| TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn shared_document(&self) -> Arc<ReplicatedDocument> {
        self.document.clone()
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.write().await = ConnectionStatus::Connecting;
        self.emit(TransportEvent::Status(ConnectionStatus::Connecting)).await;

        let url = self.url();
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connection to {url} failed: {e}");
                *self.state.write().await = ConnectionStatus::Disconnected;
                self.emit(TransportEvent::ConnectionError { message: e.to_string() }).await;
                self.emit(TransportEvent::Disconnect).await;
                return Err(TransportError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(self.channel_capacity);
        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                match outgoing {
                    Outgoing::Frame(data) => {
                        if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        let _ = ws_writer.close().await;
                        break;
                    }
                }
            }
        });
        *self.outgoing_tx.write().await = Some(out_tx.clone());

        self.send_frame(SyncMessage::join(&self.peer_info, &self.room)?).await?;
        self.send_frame(SyncMessage::sync_step1(
            self.peer_info.peer_id,
            &self.room,
            self.document.state_vector(),
        ))
        .await?;

        *self.state.write().await = ConnectionStatus::Connected;
        log::info!("Connected to {url} as {}", self.peer_info.name);
        self.emit(TransportEvent::Connect).await;
        self.emit(TransportEvent::Status(ConnectionStatus::Connected)).await;

        // Replay offline queue
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued deltas", queued.len());
            for (clock, payload) in queued {
                self.send_frame(SyncMessage::delta(self.peer_info.peer_id, &self.room, clock, payload))
                    .await?;
            }
        }

        // Reader task: merge incoming state, surface events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let current_generation = self.generation.clone();
        let document = self.document.clone();
        let peer_id = self.peer_info.peer_id;
        let room = self.room.clone();
        let reader = tokio::spawn(async move {
            let synced = AtomicBool::new(false);
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::warn!("WebSocket error on {room}: {e}");
                        let _ = event_tx
                            .send(TransportEvent::ConnectionError { message: e.to_string() })
                            .await;
                        break;
                    }
                    Ok(_) => continue,
                };
                let bytes: Vec<u8> = data.into();
                let sync_msg = match SyncMessage::decode(&bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("Dropping undecodable frame on {room}: {e}");
                        continue;
                    }
                };
                // Skip our own messages
                if sync_msg.peer_id == peer_id {
                    continue;
                }

                match sync_msg.msg_type {
                    MessageType::SyncStep2 | MessageType::Delta => {
                        if let Err(e) = document.apply_remote(&sync_msg.payload) {
                            log::warn!("Failed to merge remote update on {room}: {e}");
                        }
                        if sync_msg.msg_type == MessageType::SyncStep2
                            && !synced.swap(true, Ordering::SeqCst)
                        {
                            let _ = event_tx.send(TransportEvent::Synced).await;
                        }
                    }
                    MessageType::SyncStep1 => match document.encode_diff(&sync_msg.payload) {
                        Ok(diff) => {
                            let reply = SyncMessage::sync_step2(peer_id, &room, diff);
                            if let Ok(encoded) = reply.encode() {
                                let _ = out_tx.send(Outgoing::Frame(encoded)).await;
                            }
                        }
                        Err(e) => log::warn!("Bad state vector from server on {room}: {e}"),
                    },
                    MessageType::Awareness => match AwarenessMessage::decode(&sync_msg.payload) {
                        Ok(awareness) => {
                            let _ = event_tx.send(TransportEvent::Awareness(awareness)).await;
                        }
                        Err(e) => log::debug!("Ignoring awareness frame: {e}"),
                    },
                    _ => {}
                }
            }

            // Connection lost, unless a newer connect/disconnect took over.
            if current_generation.load(Ordering::SeqCst) == generation {
                *state.write().await = ConnectionStatus::Disconnected;
                log::info!("Connection to {room} lost");
                let _ = event_tx.send(TransportEvent::Status(ConnectionStatus::Disconnected)).await;
                let _ = event_tx.send(TransportEvent::Disconnect).await;
            }
        });
        if let Some(previous) = self.reader.lock().await.replace(reader) {
            previous.abort();
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.outgoing_tx.write().await.take() {
            let leave = SyncMessage::leave(self.peer_info.peer_id, &self.room);
            if let Ok(encoded) = leave.encode() {
                let _ = tx.send(Outgoing::Frame(encoded)).await;
            }
            let _ = tx.send(Outgoing::Close).await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }

        let was = std::mem::replace(&mut *self.state.write().await, ConnectionStatus::Disconnected);
        if was != ConnectionStatus::Disconnected {
            self.emit(TransportEvent::Status(ConnectionStatus::Disconnected)).await;
            self.emit(TransportEvent::Disconnect).await;
        }
        Ok(())
    }

    async fn send_update(&self, update: Vec<u8>) -> Result<(), TransportError> {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;

        if *self.state.read().await != ConnectionStatus::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(clock, update) {
                return Err(TransportError::QueueFull);
            }
            return Ok(());
        }

        self.send_frame(SyncMessage::delta(self.peer_info.peer_id, &self.room, clock, update))
            .await
    }

    async fn send_awareness(&self, msg: &AwarenessMessage) -> Result<(), TransportError> {
        if *self.state.read().await != ConnectionStatus::Connected {
            return Ok(());
        }
        let payload = msg.encode()?;
        let clock = self.clock.load(Ordering::SeqCst);
        self.send_frame(SyncMessage::awareness(self.peer_info.peer_id, &self.room, clock, payload))
            .await
    }
}

/// Creates one [`WebSocketTransport`] per bound session.
pub struct WebSocketTransportFactory {
    config: SessionConfig,
    peer_name: String,
}

impl WebSocketTransportFactory {
    pub fn new(config: SessionConfig, peer_name: impl Into<String>) -> Self {
        Self {
            config,
            peer_name: peer_name.into(),
        }
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(
        &self,
        identity: &DocumentIdentity,
        document: Arc<ReplicatedDocument>,
    ) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new(
            PeerInfo::new(self.peer_name.clone()),
            identity.room_name(&self.config.room_prefix),
            document,
            &self.config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> WebSocketTransport {
        let config = SessionConfig {
            server_url: "ws://127.0.0.1:9".to_string(),
            ..SessionConfig::for_testing()
        };
        WebSocketTransport::new(
            PeerInfo::new("TestUser"),
            "document-test",
            Arc::new(ReplicatedDocument::new()),
            &config,
        )
    }

    #[test]
    fn test_url_joins_room() {
        let t = transport();
        assert_eq!(t.url(), "ws://127.0.0.1:9/document-test");
        assert_eq!(t.room(), "document-test");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let t = transport();
        assert_eq!(t.connection_state().await, ConnectionStatus::Disconnected);
        assert_eq!(t.clock(), 0);
        assert_eq!(t.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_update_offline_queues() {
        let t = transport();
        t.send_update(vec![1, 2, 3]).await.unwrap();
        t.send_update(vec![4, 5, 6]).await.unwrap();
        assert_eq!(t.offline_queue_len().await, 2);
        assert_eq!(t.clock(), 2);
    }

    #[tokio::test]
    async fn test_send_awareness_offline_noop() {
        let t = transport();
        let msg = AwarenessMessage::Leave { user_id: "u".to_string() };
        t.send_awareness(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_emits_error_then_disconnect() {
        let mut t = transport();
        let mut events = t.take_events().unwrap();
        assert!(t.connect().await.is_err());

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Status(ConnectionStatus::Connecting))
        );
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::ConnectionError { .. })
        ));
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnect));
        assert_eq!(t.connection_state().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_take_events_once() {
        let mut t = transport();
        assert!(t.take_events().is_some());
        assert!(t.take_events().is_none());
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(1, vec![1, 2, 3]);
        queue.enqueue(2, vec![4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained[0], (1, vec![1, 2, 3]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.enqueue(1, vec![1]));
        assert!(queue.enqueue(2, vec![2]));
        assert!(queue.enqueue(3, vec![3]));
        assert!(!queue.enqueue(4, vec![4]));
        queue.clear();
        assert!(queue.is_empty());
    }
}
