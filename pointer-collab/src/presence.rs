//! Presence protocol: who else is in the document and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresencePublisher::update_local_cursor()
//!       │  (rate-limited: 30fps)
//!       ▼
//! AwarenessMessage::Cursor { … }
//!       │
//!       ▼   (transport awareness channel)
//! Remote PresencePublisher::handle_remote()
//!       │
//!       ▼
//! PresenceRoom (remote peers, idle cleanup)
//! ```
//!
//! Actor colors come from a fixed palette and are deterministic per actor
//! id, so a peer keeps its color across reconnects.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::protocol::ProtocolError;

/// Cursor palette shared by every client.
pub const PALETTE: [&str; 12] = [
    "#ff6b6b", "#4ecdc4", "#45b7d1", "#96ceb4", "#ffeaa7", "#dda0dd", "#98d8c8", "#ff7f50",
    "#74b9ff", "#a29bfe", "#fd79a8", "#fdcb6e",
];

/// Neutral color used for unauthenticated actors.
pub const ANONYMOUS_COLOR: &str = "#6b7280";

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// What the identity provider knows about the signed-in user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthIdentity {
    pub id: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub avatar: Option<String>,
}

/// Palette color for an actor id.
///
/// Java-style string hash over UTF-16 code units (`c + (h << 5) - h`, with
/// the shift on the 32-bit value), then `|h| mod 12`.
pub fn palette_color(actor_id: &str) -> &'static str {
    let mut hash: i64 = 0;
    for unit in actor_id.encode_utf16() {
        let shifted = i64::from((hash as i32).wrapping_shl(5));
        hash = i64::from(unit) + (shifted - hash);
    }
    PALETTE[(hash.unsigned_abs() % PALETTE.len() as u64) as usize]
}

/// Process-lifetime cache of actor colors.
#[derive(Default)]
pub struct ColorCache {
    colors: Mutex<HashMap<String, &'static str>>,
}

impl ColorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color_for(&self, actor_id: &str) -> &'static str {
        *self
            .colors
            .lock()
            .entry(actor_id.to_string())
            .or_insert_with(|| palette_color(actor_id))
    }

    pub fn len(&self) -> usize {
        self.colors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.lock().is_empty()
    }
}

/// The local actor as other peers see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalActor {
    pub id: String,
    pub name: String,
    pub color: String,
    pub avatar: Option<String>,
}

impl LocalActor {
    /// Build from the identity provider; `None` yields an anonymous actor.
    pub fn from_auth(auth: Option<&AuthIdentity>, colors: &ColorCache) -> Self {
        let Some(user) = auth else {
            return Self::anonymous();
        };

        let name = user
            .full_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| {
                user.email
                    .as_deref()
                    .and_then(|e| e.split('@').next())
                    .filter(|prefix| !prefix.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "Unknown User".to_string());

        Self {
            id: user.id.clone(),
            name,
            color: colors.color_for(&user.id).to_string(),
            avatar: user.avatar.clone(),
        }
    }

    /// Ephemeral identity for signed-out use.
    pub fn anonymous() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self {
            id: format!("anonymous-{millis}"),
            name: "Anonymous User".to_string(),
            color: ANONYMOUS_COLOR.to_string(),
            avatar: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.starts_with("anonymous-")
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Awareness payload carried inside `MessageType::Awareness` frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Enter the room with a profile.
    Join {
        user_id: String,
        user_name: String,
        user_color: String,
        avatar: Option<String>,
    },

    /// Clean leave.
    Leave { user_id: String },

    /// Text cursor (anchor/head as document positions), rate-limited.
    Cursor {
        user_id: String,
        anchor: u32,
        head: u32,
        /// Sender-side monotonic counter.
        timestamp: u64,
    },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn user_id(&self) -> &str {
        match self {
            AwarenessMessage::Join { user_id, .. }
            | AwarenessMessage::Leave { user_id }
            | AwarenessMessage::Cursor { user_id, .. } => user_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote peers
// ───────────────────────────────────────────────────────────────────

/// A remote peer as tracked locally.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePeer {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub avatar: Option<String>,
    /// `(anchor, head)` of the last cursor update
    pub cursor: Option<(u32, u32)>,
    last_timestamp: u64,
    last_update: Instant,
}

impl RemotePeer {
    fn new(user_id: String, user_name: String, color: String, avatar: Option<String>) -> Self {
        Self {
            user_id,
            user_name,
            color,
            avatar,
            cursor: None,
            last_timestamp: 0,
            last_update: Instant::now(),
        }
    }

    /// Apply a cursor update unless it is older than the last one seen.
    fn update_cursor(&mut self, anchor: u32, head: u32, timestamp: u64) {
        self.touch();
        if timestamp < self.last_timestamp {
            return;
        }
        self.cursor = Some((anchor, head));
        self.last_timestamp = timestamp;
    }

    fn touch(&mut self) {
        self.last_update = Instant::now();
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// Presence state of every remote peer in one document room.
pub struct PresenceRoom {
    local_user_id: String,
    peers: HashMap<String, RemotePeer>,
    idle_timeout: Duration,
}

impl PresenceRoom {
    pub fn new(local_user_id: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peers: HashMap::new(),
            idle_timeout,
        }
    }

    /// Handle an incoming awareness message. Own messages are ignored.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) {
        if msg.user_id() == self.local_user_id {
            return;
        }

        match msg {
            AwarenessMessage::Join { user_id, user_name, user_color, avatar } => {
                // A repeated join is a heartbeat: refresh the profile, keep the cursor.
                if let Some(peer) = self.peers.get_mut(user_id) {
                    log::trace!("Presence: {user_name} is still here");
                    peer.user_name = user_name.clone();
                    peer.color = user_color.clone();
                    peer.avatar = avatar.clone();
                    peer.touch();
                    return;
                }
                log::info!("Presence: {user_name} joined");
                self.peers.insert(
                    user_id.clone(),
                    RemotePeer::new(user_id.clone(), user_name.clone(), user_color.clone(), avatar.clone()),
                );
            }

            AwarenessMessage::Leave { user_id } => {
                if self.peers.remove(user_id).is_some() {
                    log::info!("Presence: {user_id} left");
                }
            }

            AwarenessMessage::Cursor { user_id, anchor, head, timestamp } => {
                log::trace!("Presence: cursor update from {user_id}");
                // Cursor from a peer that joined before we connected.
                let peer = self.peers.entry(user_id.clone()).or_insert_with(|| {
                    let short: String = user_id.chars().take(8).collect();
                    RemotePeer::new(
                        user_id.clone(),
                        format!("Peer-{short}"),
                        palette_color(user_id).to_string(),
                        None,
                    )
                });
                peer.update_cursor(*anchor, *head, *timestamp);
            }
        }
    }

    pub fn peer(&self, user_id: &str) -> Option<&RemotePeer> {
        self.peers.get(user_id)
    }

    /// Remote peers sorted by id.
    pub fn peers(&self) -> Vec<RemotePeer> {
        let mut peers: Vec<RemotePeer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop peers not heard from within the idle timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<String> {
        let timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Publisher
// ───────────────────────────────────────────────────────────────────

/// Publishes the local actor's presence and tracks remote peers.
pub struct PresencePublisher {
    actor: LocalActor,
    room: PresenceRoom,
    cursor_interval: Duration,
    last_cursor_broadcast: Option<Instant>,
    timestamp_counter: u64,
}

impl PresencePublisher {
    pub fn new(actor: LocalActor, cursor_interval: Duration, idle_timeout: Duration) -> Self {
        let room = PresenceRoom::new(actor.id.clone(), idle_timeout);
        Self {
            actor,
            room,
            cursor_interval,
            last_cursor_broadcast: None,
            timestamp_counter: 0,
        }
    }

    pub fn actor(&self) -> &LocalActor {
        &self.actor
    }

    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join {
            user_id: self.actor.id.clone(),
            user_name: self.actor.name.clone(),
            user_color: self.actor.color.clone(),
            avatar: self.actor.avatar.clone(),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            user_id: self.actor.id.clone(),
        }
    }

    /// Cursor message for the new position, or `None` while throttled.
    pub fn update_local_cursor(&mut self, anchor: u32, head: u32) -> Option<AwarenessMessage> {
        let now = Instant::now();
        if let Some(last) = self.last_cursor_broadcast {
            if now.duration_since(last) < self.cursor_interval {
                return None;
            }
        }
        self.last_cursor_broadcast = Some(now);
        self.timestamp_counter += 1;
        Some(AwarenessMessage::Cursor {
            user_id: self.actor.id.clone(),
            anchor,
            head,
            timestamp: self.timestamp_counter,
        })
    }

    pub fn handle_remote(&mut self, msg: &AwarenessMessage) {
        self.room.handle_message(msg);
    }

    pub fn room(&self) -> &PresenceRoom {
        &self.room
    }

    pub fn room_mut(&mut self) -> &mut PresenceRoom {
        &mut self.room
    }
}

// ===================================================================
// Tests
// ===================================================================
