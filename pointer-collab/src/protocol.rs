//! Binary protocol between transports and the relay server.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake:
//! ```text
//! client                              server
//!   │── Join ───────────────────────────►│
//!   │── SyncStep1(client sv) ───────────►│
//!   │◄─────────── SyncStep2(diff) ───────│   first SyncStep2 ⇒ "synced"
//!   │◄─────────── SyncStep1(server sv) ──│
//!   │── SyncStep2(diff) ────────────────►│   fanned out as Delta
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asking for what the sender lacks
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Delta = 3,
    /// Presence payload (`AwarenessMessage`)
    Awareness = 4,
    /// Peer enters a room
    Join = 5,
    /// Peer leaves a room
    Leave = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Peer identity sent with `Join`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Replication room (`document-{identity}`)
    pub room: String,
    /// Lamport clock of the sender
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    pub fn delta(peer_id: Uuid, room: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room, clock, update)
    }

    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, diff)
    }

    /// Wrap an already encoded awareness payload.
    pub fn awareness(peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, peer_id, room, clock, payload)
    }

    pub fn join(info: &PeerInfo, room: &str) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Join, info.peer_id, room, 0, payload))
    }

    pub fn leave(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::Leave, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the `Join` payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
}
