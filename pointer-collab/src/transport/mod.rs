//! Replication transport: a bidirectional link between one shared document
//! and the replication server.
//!
//! Every adapter implements the same [`Transport`] capability. The
//! transport owns the merge path: updates received from the network are
//! applied to [`Transport::shared_document`] under the remote origin, so
//! the session only ever sees them as document update events. Outbound
//! local updates are handed to [`Transport::send_update`].
//!
//! - [`websocket`]: WebSocket client with offline queue
//! - [`memory`]: in-process hub used by tests and embedders

use async_trait::async_trait;
use pointer_core::{DocumentIdentity, ReplicatedDocument};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::presence::AwarenessMessage;
use crate::protocol::ProtocolError;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryHub, MemoryTransport};
pub use websocket::{OfflineQueue, WebSocketTransport, WebSocketTransportFactory};

/// Lifecycle status as reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

/// Events emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Link established
    Connect,
    /// Link lost or closed
    Disconnect,
    /// Status change notification
    Status(ConnectionStatus),
    /// Initial state exchange finished for the current connection
    Synced,
    /// Socket-level failure; always followed by `Disconnect`
    ConnectionError { message: String },
    /// Presence payload from another peer
    Awareness(AwarenessMessage),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error("offline queue full")]
    QueueFull,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One replication link bound to a single shared document.
///
/// Connect failures are reported both as the returned error and as a
/// `ConnectionError` + `Disconnect` event pair; sessions react to events.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The mergeable document this transport replicates.
    fn shared_document(&self) -> Arc<ReplicatedDocument>;

    /// Take the event receiver (only the first call returns it).
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;

    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the link. Close errors are swallowed.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send a locally produced update (queued while offline where supported).
    async fn send_update(&self, update: Vec<u8>) -> Result<(), TransportError>;

    /// Send presence; dropped silently while offline.
    async fn send_awareness(&self, msg: &AwarenessMessage) -> Result<(), TransportError>;
}

/// Creates transports for newly bound sessions.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        identity: &DocumentIdentity,
        document: Arc<ReplicatedDocument>,
    ) -> Box<dyn Transport>;
}
