//! In-process replication hub.
//!
//! ```text
//! MemoryTransport A ──┐
//!                     ├── MemoryHub ── room (identity) ── authoritative document
//! MemoryTransport B ──┘                   │
//!                                         └── fan-out to the other connections
//! ```
//!
//! Connecting exchanges state both ways synchronously, so a transport is
//! `synced` as soon as `connect` returns. The hub can be taken offline and
//! connections can be dropped on demand to exercise reconnect paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use pointer_core::{DocumentIdentity, ReplicatedDocument};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ConnectionStatus, Transport, TransportError, TransportEvent, TransportFactory};
use crate::presence::AwarenessMessage;

enum HubFrame {
    Update(Vec<u8>),
    Awareness(AwarenessMessage),
    Kicked,
}

struct HubRoom {
    document: Arc<ReplicatedDocument>,
    peers: HashMap<u64, mpsc::UnboundedSender<HubFrame>>,
    connect_attempts: u32,
}

impl HubRoom {
    fn new() -> Self {
        Self {
            document: Arc::new(ReplicatedDocument::new()),
            peers: HashMap::new(),
            connect_attempts: 0,
        }
    }

    fn fan_out(&self, except: Option<u64>, frame: impl Fn() -> HubFrame) {
        for (conn_id, tx) in &self.peers {
            if Some(*conn_id) != except {
                let _ = tx.send(frame());
            }
        }
    }
}

struct HubInner {
    rooms: Mutex<HashMap<DocumentIdentity, HubRoom>>,
    online: AtomicBool,
    next_conn: AtomicU64,
    channel_capacity: usize,
}

/// Shared in-process replication server. Cheap to clone.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_channel_capacity(256)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                next_conn: AtomicU64::new(1),
                channel_capacity,
            }),
        }
    }

    /// Taking the hub offline drops every live connection and makes
    /// further connects fail until it comes back.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        if !online {
            let mut rooms = self.inner.rooms.lock();
            for room in rooms.values_mut() {
                room.fan_out(None, || HubFrame::Kicked);
                room.peers.clear();
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Force-disconnect every connection to `identity`'s room.
    pub fn drop_connections(&self, identity: &DocumentIdentity) -> usize {
        let mut rooms = self.inner.rooms.lock();
        let Some(room) = rooms.get_mut(identity) else {
            return 0;
        };
        room.fan_out(None, || HubFrame::Kicked);
        let dropped = room.peers.len();
        room.peers.clear();
        dropped
    }

    /// Connect attempts seen for `identity`, successful or not.
    pub fn connect_attempts(&self, identity: &DocumentIdentity) -> u32 {
        self.inner
            .rooms
            .lock()
            .get(identity)
            .map_or(0, |room| room.connect_attempts)
    }

    pub fn peer_count(&self, identity: &DocumentIdentity) -> usize {
        self.inner
            .rooms
            .lock()
            .get(identity)
            .map_or(0, |room| room.peers.len())
    }

    /// Plain text of the room's authoritative document.
    pub fn room_text(&self, identity: &DocumentIdentity) -> Option<String> {
        let document = self.inner.rooms.lock().get(identity)?.document.clone();
        document.plain_text().ok()
    }

    /// Full state of the room as a v1 update.
    pub fn room_state(&self, identity: &DocumentIdentity) -> Option<Vec<u8>> {
        let document = self.inner.rooms.lock().get(identity)?.document.clone();
        Some(document.encode_state_as_update())
    }

    /// Merge an update from an outside peer and forward it to every connection.
    pub fn apply_update(&self, identity: &DocumentIdentity, update: &[u8]) -> Result<(), TransportError> {
        let mut rooms = self.inner.rooms.lock();
        let room = rooms.entry(identity.clone()).or_insert_with(HubRoom::new);
        room.document
            .apply_remote(update)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        room.fan_out(None, || HubFrame::Update(update.to_vec()));
        Ok(())
    }

    fn register(
        &self,
        identity: &DocumentIdentity,
        client: &ReplicatedDocument,
    ) -> Result<(u64, mpsc::UnboundedReceiver<HubFrame>), String> {
        let mut rooms = self.inner.rooms.lock();
        let room = rooms.entry(identity.clone()).or_insert_with(HubRoom::new);
        room.connect_attempts += 1;
        if !self.is_online() {
            return Err("hub offline".to_string());
        }

        let to_client = room
            .document
            .encode_diff(&client.state_vector())
            .map_err(|e| e.to_string())?;
        client.apply_remote(&to_client).map_err(|e| e.to_string())?;

        let to_hub = client
            .encode_diff(&room.document.state_vector())
            .map_err(|e| e.to_string())?;
        room.document.apply_remote(&to_hub).map_err(|e| e.to_string())?;
        room.fan_out(None, || HubFrame::Update(to_hub.clone()));

        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        room.peers.insert(conn_id, tx);
        Ok((conn_id, rx))
    }

    fn unregister(&self, identity: &DocumentIdentity, conn_id: u64) {
        if let Some(room) = self.inner.rooms.lock().get_mut(identity) {
            room.peers.remove(&conn_id);
        }
    }

    fn publish_update(&self, identity: &DocumentIdentity, conn_id: u64, update: &[u8]) -> Result<(), TransportError> {
        let mut rooms = self.inner.rooms.lock();
        let room = rooms.get_mut(identity).ok_or(TransportError::NotConnected)?;
        if !room.peers.contains_key(&conn_id) {
            return Err(TransportError::NotConnected);
        }
        if let Err(e) = room.document.apply_remote(update) {
            log::warn!("Hub rejected update for {identity}: {e}");
            return Ok(());
        }
        room.fan_out(Some(conn_id), || HubFrame::Update(update.to_vec()));
        Ok(())
    }

    fn publish_awareness(&self, identity: &DocumentIdentity, conn_id: u64, msg: &AwarenessMessage) {
        if let Some(room) = self.inner.rooms.lock().get(identity) {
            room.fan_out(Some(conn_id), || HubFrame::Awareness(msg.clone()));
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for MemoryHub {
    fn create(
        &self,
        identity: &DocumentIdentity,
        document: Arc<ReplicatedDocument>,
    ) -> Box<dyn Transport> {
        Box::new(MemoryTransport::new(self.clone(), identity.clone(), document))
    }
}

struct Link {
    conn_id: u64,
    pump: JoinHandle<()>,
}

/// A transport attached to a [`MemoryHub`] room.
pub struct MemoryTransport {
    hub: MemoryHub,
    identity: DocumentIdentity,
    document: Arc<ReplicatedDocument>,
    link: Mutex<Option<Link>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
}

impl MemoryTransport {
    pub fn new(hub: MemoryHub, identity: DocumentIdentity, document: Arc<ReplicatedDocument>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(hub.inner.channel_capacity);
        Self {
            hub,
            identity,
            document,
            link: Mutex::new(None),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|link| !link.pump.is_finished())
    }

    fn conn_id(&self) -> Option<u64> {
        self.link.lock().as_ref().map(|link| link.conn_id)
    }

    fn detach(&self) -> bool {
        match self.link.lock().take() {
            Some(link) => {
                link.pump.abort();
                self.hub.unregister(&self.identity, link.conn_id);
                true
            }
            None => false,
        }
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn shared_document(&self) -> Arc<ReplicatedDocument> {
        self.document.clone()
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.detach();
        self.emit(TransportEvent::Status(ConnectionStatus::Connecting)).await;

        let (conn_id, mut frames) = match self.hub.register(&self.identity, &self.document) {
            Ok(registration) => registration,
            Err(message) => {
                log::warn!("Connection to hub room {} failed: {message}", self.identity);
                self.emit(TransportEvent::ConnectionError { message: message.clone() }).await;
                self.emit(TransportEvent::Disconnect).await;
                return Err(TransportError::Connect(message));
            }
        };

        let document = self.document.clone();
        let event_tx = self.event_tx.clone();
        let identity = self.identity.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                match frame {
                    HubFrame::Update(update) => {
                        if let Err(e) = document.apply_remote(&update) {
                            log::warn!("Failed to merge hub update for {identity}: {e}");
                        }
                    }
                    HubFrame::Awareness(msg) => {
                        let _ = event_tx.send(TransportEvent::Awareness(msg)).await;
                    }
                    HubFrame::Kicked => break,
                }
            }
            log::info!("Hub connection for {identity} lost");
            let _ = event_tx.send(TransportEvent::Status(ConnectionStatus::Disconnected)).await;
            let _ = event_tx.send(TransportEvent::Disconnect).await;
        });
        *self.link.lock() = Some(Link { conn_id, pump });

        self.emit(TransportEvent::Connect).await;
        self.emit(TransportEvent::Status(ConnectionStatus::Connected)).await;
        self.emit(TransportEvent::Synced).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.detach() {
            self.emit(TransportEvent::Status(ConnectionStatus::Disconnected)).await;
            self.emit(TransportEvent::Disconnect).await;
        }
        Ok(())
    }

    async fn send_update(&self, update: Vec<u8>) -> Result<(), TransportError> {
        match self.conn_id() {
            Some(conn_id) => self.hub.publish_update(&self.identity, conn_id, &update),
            // State is exchanged in full on the next connect.
            None => Ok(()),
        }
    }

    async fn send_awareness(&self, msg: &AwarenessMessage) -> Result<(), TransportError> {
        if let Some(conn_id) = self.conn_id() {
            self.hub.publish_awareness(&self.identity, conn_id, msg);
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pointer_core::{Node, Snapshot};

    fn transport(hub: &MemoryHub, id: &str) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let mut t = MemoryTransport::new(hub.clone(), DocumentIdentity::from(id), Arc::new(ReplicatedDocument::new()));
        let events = t.take_events().unwrap();
        (t, events)
    }

    #[tokio::test]
    async fn test_connect_emits_connect_status_synced() {
        let hub = MemoryHub::new();
        let (t, mut events) = transport(&hub, "n1");
        t.connect().await.unwrap();

        assert_eq!(events.recv().await, Some(TransportEvent::Status(ConnectionStatus::Connecting)));
        assert_eq!(events.recv().await, Some(TransportEvent::Connect));
        assert_eq!(events.recv().await, Some(TransportEvent::Status(ConnectionStatus::Connected)));
        assert_eq!(events.recv().await, Some(TransportEvent::Synced));
        assert!(t.is_connected());
        assert_eq!(hub.peer_count(&DocumentIdentity::from("n1")), 1);
    }

    #[tokio::test]
    async fn test_offline_hub_rejects_connect() {
        let hub = MemoryHub::new();
        hub.set_online(false);
        let (t, mut events) = transport(&hub, "n1");
        assert!(t.connect().await.is_err());

        let _connecting = events.recv().await;
        assert!(matches!(events.recv().await, Some(TransportEvent::ConnectionError { .. })));
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnect));
        assert_eq!(hub.connect_attempts(&DocumentIdentity::from("n1")), 1);
    }

    #[tokio::test]
    async fn test_updates_reach_other_connection() {
        let hub = MemoryHub::new();
        let (a, _ea) = transport(&hub, "n1");
        let (b, _eb) = transport(&hub, "n1");
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let doc_a = a.shared_document();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = doc_a
            .observe_updates(move |_, update| sink.lock().push(update.to_vec()))
            .unwrap();
        doc_a.append_block(&Node::paragraph("hello")).unwrap();
        let update = seen.lock().pop().unwrap();
        a.send_update(update).await.unwrap();

        // b's pump applies the frame asynchronously
        for _ in 0..50 {
            if b.shared_document().plain_text().unwrap() == "hello" {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(b.shared_document().plain_text().unwrap(), "hello");
        assert_eq!(hub.room_text(&DocumentIdentity::from("n1")).as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_connect_pulls_existing_room_state() {
        let hub = MemoryHub::new();
        let id = DocumentIdentity::from("n1");
        let outside = ReplicatedDocument::new();
        let update = outside.seed(&Snapshot::from_paragraphs(&["from peer"])).unwrap();
        hub.apply_update(&id, &update).unwrap();

        let (t, _events) = transport(&hub, "n1");
        t.connect().await.unwrap();
        assert_eq!(t.shared_document().plain_text().unwrap(), "from peer");
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let hub = MemoryHub::new();
        let (a, _ea) = transport(&hub, "n1");
        a.shared_document().append_block(&Node::paragraph("only n1")).unwrap();
        a.connect().await.unwrap();

        let (b, _eb) = transport(&hub, "n2");
        b.connect().await.unwrap();
        assert!(!b.shared_document().has_content());
    }

    #[tokio::test]
    async fn test_drop_connections_emits_disconnect() {
        let hub = MemoryHub::new();
        let (t, mut events) = transport(&hub, "n1");
        t.connect().await.unwrap();
        for _ in 0..4 {
            events.recv().await;
        }

        assert_eq!(hub.drop_connections(&DocumentIdentity::from("n1")), 1);
        assert_eq!(events.recv().await, Some(TransportEvent::Status(ConnectionStatus::Disconnected)));
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnect));
    }

    #[tokio::test]
    async fn test_awareness_is_not_echoed() {
        let hub = MemoryHub::new();
        let (a, mut ea) = transport(&hub, "n1");
        let (b, mut eb) = transport(&hub, "n1");
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        for _ in 0..4 {
            ea.recv().await;
            eb.recv().await;
        }

        let msg = AwarenessMessage::Leave { user_id: "a".to_string() };
        a.send_awareness(&msg).await.unwrap();
        assert_eq!(eb.recv().await, Some(TransportEvent::Awareness(msg)));
        assert!(ea.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let hub = MemoryHub::new();
        let (t, _events) = transport(&hub, "n1");
        t.connect().await.unwrap();
        t.disconnect().await.unwrap();
        t.disconnect().await.unwrap();
        assert!(!t.is_connected());
        assert_eq!(hub.peer_count(&DocumentIdentity::from("n1")), 0);
    }
}
