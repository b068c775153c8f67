//! Session configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one editing session and its transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL of the replication server
    pub server_url: String,
    /// Prefix of replication room names (`{prefix}-{identity}`)
    pub room_prefix: String,
    /// Fixed delay before an automatic reconnect attempt
    pub reconnect_delay: Duration,
    /// Automatic reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Debounce window for collaborative notes
    pub collaborative_save_delay: Duration,
    /// Debounce window for notes edited without replication
    pub local_save_delay: Duration,
    /// Minimum interval between two cursor broadcasts
    pub cursor_broadcast_interval: Duration,
    /// Remote peers silent for this long are dropped from presence
    pub presence_idle_timeout: Duration,
    /// Interval between join re-announcements while connected
    pub presence_heartbeat_interval: Duration,
    /// Deltas kept while the transport is offline
    pub offline_queue_capacity: usize,
    /// Capacity of internal channels
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:1999".to_string(),
            room_prefix: "document".to_string(),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 5,
            collaborative_save_delay: Duration::from_millis(2500),
            local_save_delay: Duration::from_millis(3000),
            cursor_broadcast_interval: Duration::from_millis(33),
            presence_idle_timeout: Duration::from_secs(30),
            presence_heartbeat_interval: Duration::from_secs(10),
            offline_queue_capacity: 10_000,
            channel_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Defaults with no cursor throttling, for tests.
    pub fn for_testing() -> Self {
        Self {
            cursor_broadcast_interval: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn save_delay(&self, collaborative: bool) -> Duration {
        if collaborative {
            self.collaborative_save_delay
        } else {
            self.local_save_delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.save_delay(true), Duration::from_millis(2500));
        assert_eq!(config.save_delay(false), Duration::from_millis(3000));
        assert!(config.presence_heartbeat_interval < config.presence_idle_timeout);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{ "server_url": "wss://sync.example.com" }"#).unwrap();
        assert_eq!(config.server_url, "wss://sync.example.com");
        assert_eq!(config.room_prefix, "document");
        assert_eq!(config.offline_queue_capacity, 10_000);
    }
}
