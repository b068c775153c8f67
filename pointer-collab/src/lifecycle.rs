//! Connection lifecycle state machine.
//!
//! ```text
//!              on_connect / status(connected)
//!  Connecting ─────────────────────────────────► Connected
//!      ▲                                            │
//!      │ poll_reconnect (after delay,               │ on_disconnect / on_error
//!      │ attempts < max)                            ▼
//!      └──────────────────────────────────────  Disconnected
//! ```
//!
//! The machine does no IO. The session driver feeds it transport events,
//! asks it when the next reconnect is due and performs the connect itself.

use std::time::Duration;
use tokio::time::Instant;

use crate::transport::ConnectionStatus;

/// What the caller should do with the transport after a visibility change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Nothing,
    Connect,
    Disconnect,
}

#[derive(Debug)]
pub struct ConnectionLifecycle {
    status: ConnectionStatus,
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
    auto_reconnect: bool,
    reconnect_at: Option<Instant>,
    synced: bool,
    suspended: bool,
}

impl ConnectionLifecycle {
    /// A freshly bound session starts out `Connecting`.
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            attempts: 0,
            max_attempts,
            delay,
            auto_reconnect: true,
            reconnect_at: None,
            synced: false,
            suspended: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// The editing surface is writable only while connected.
    pub fn is_editable(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Returns `true` if this was a transition into `Connected`.
    pub fn on_connect(&mut self) -> bool {
        if self.status == ConnectionStatus::Connected {
            return false;
        }
        log::info!("Connection established");
        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
        self.reconnect_at = None;
        true
    }

    /// Returns `true` when the status actually changed.
    pub fn on_status(&mut self, status: ConnectionStatus) -> bool {
        match status {
            ConnectionStatus::Connected => self.on_connect(),
            ConnectionStatus::Disconnected => self.on_disconnect(),
            ConnectionStatus::Connecting => {
                if self.status == ConnectionStatus::Connecting {
                    return false;
                }
                self.status = ConnectionStatus::Connecting;
                self.synced = false;
                true
            }
        }
    }

    /// Returns `true` for the first sync of the current connection.
    pub fn on_synced(&mut self) -> bool {
        !std::mem::replace(&mut self.synced, true)
    }

    /// Enter `Disconnected` and schedule an automatic retry if allowed.
    ///
    /// Returns `true` when the status actually changed.
    pub fn on_disconnect(&mut self) -> bool {
        if self.status == ConnectionStatus::Disconnected {
            return false;
        }
        log::info!("Connection lost");
        self.status = ConnectionStatus::Disconnected;
        self.synced = false;
        self.schedule_reconnect();
        true
    }

    /// Socket errors are never fatal; they count as a disconnect.
    pub fn on_error(&mut self, message: &str) -> bool {
        log::warn!("Connection error: {message}");
        self.on_disconnect()
    }

    fn schedule_reconnect(&mut self) {
        if !self.auto_reconnect {
            return;
        }
        if self.attempts >= self.max_attempts {
            log::warn!(
                "Giving up after {} reconnect attempts; manual reconnect required",
                self.attempts
            );
            self.reconnect_at = None;
            return;
        }
        self.attempts += 1;
        self.reconnect_at = Some(Instant::now() + self.delay);
        log::info!(
            "Reconnect attempt {}/{} in {:?}",
            self.attempts,
            self.max_attempts,
            self.delay
        );
    }

    /// `true` when a scheduled reconnect is due; the caller then connects.
    pub fn poll_reconnect(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if at <= now => {
                self.reconnect_at = None;
                self.status = ConnectionStatus::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Explicit disconnect: no automatic retries until `reconnect`.
    pub fn disconnect(&mut self) {
        self.auto_reconnect = false;
        self.reconnect_at = None;
        self.status = ConnectionStatus::Disconnected;
        self.synced = false;
    }

    /// Manual reconnect. Works past the attempt ceiling; the counter is
    /// only reset by a successful connect.
    pub fn reconnect(&mut self) {
        self.auto_reconnect = true;
        self.suspended = false;
        self.reconnect_at = None;
        self.status = ConnectionStatus::Connecting;
        self.synced = false;
    }

    /// Hidden pages drop their connection; showing the page again resumes
    /// it only if it was suspended by hiding.
    pub fn set_visible(&mut self, visible: bool) -> LifecycleAction {
        if visible {
            if !self.suspended {
                return LifecycleAction::Nothing;
            }
            log::info!("Page visible again, resuming connection");
            self.reconnect();
            return LifecycleAction::Connect;
        }

        if self.suspended || (!self.auto_reconnect && self.status == ConnectionStatus::Disconnected) {
            return LifecycleAction::Nothing;
        }
        log::info!("Page hidden, suspending connection");
        self.disconnect();
        self.suspended = true;
        LifecycleAction::Disconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> ConnectionLifecycle {
        ConnectionLifecycle::new(Duration::from_secs(3), 5)
    }

    #[test]
    fn test_initial_state_is_connecting() {
        let lc = lifecycle();
        assert_eq!(lc.status(), ConnectionStatus::Connecting);
        assert!(!lc.is_editable());
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn test_status_connected_equals_connect() {
        let mut lc = lifecycle();
        assert!(lc.on_status(ConnectionStatus::Connected));
        assert!(lc.is_editable());
        // duplicate connect is a no-op
        assert!(!lc.on_connect());
        assert!(!lc.on_status(ConnectionStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_schedules_reconnect_after_delay() {
        let mut lc = lifecycle();
        lc.on_connect();
        assert!(lc.on_disconnect());
        assert_eq!(lc.attempts(), 1);

        let deadline = lc.reconnect_deadline().unwrap();
        assert_eq!(deadline - Instant::now(), Duration::from_secs(3));
        assert!(!lc.poll_reconnect(Instant::now()));
        assert!(lc.poll_reconnect(deadline));
        assert_eq!(lc.status(), ConnectionStatus::Connecting);
        assert!(lc.reconnect_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_disconnect_counts_once() {
        let mut lc = lifecycle();
        lc.on_connect();
        lc.on_error("socket reset");
        assert!(!lc.on_disconnect());
        assert_eq!(lc.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_ceiling() {
        let mut lc = lifecycle();
        lc.on_connect();

        let mut scheduled = 0;
        for _ in 0..6 {
            lc.on_disconnect();
            if let Some(at) = lc.reconnect_deadline() {
                scheduled += 1;
                assert!(lc.poll_reconnect(at));
            }
        }
        assert_eq!(scheduled, 5);
        assert_eq!(lc.attempts(), 5);
        assert!(lc.reconnect_deadline().is_none());

        // manual reconnect still allowed, success resets the counter
        lc.reconnect();
        assert_eq!(lc.status(), ConnectionStatus::Connecting);
        assert!(lc.on_connect());
        assert_eq!(lc.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_resets_attempts() {
        let mut lc = lifecycle();
        lc.on_connect();
        lc.on_disconnect();
        lc.on_disconnect();
        assert_eq!(lc.attempts(), 1);
        lc.on_connect();
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn test_explicit_disconnect_disables_retries() {
        let mut lc = lifecycle();
        lc.on_connect();
        lc.disconnect();
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
        // the transport's own disconnect event arrives afterwards
        assert!(!lc.on_disconnect());
        assert!(lc.reconnect_deadline().is_none());
    }

    #[test]
    fn test_synced_first_per_connection() {
        let mut lc = lifecycle();
        lc.on_connect();
        assert!(lc.on_synced());
        assert!(!lc.on_synced());
        lc.on_disconnect();
        lc.on_connect();
        assert!(lc.on_synced());
    }

    #[test]
    fn test_visibility_suspends_and_resumes() {
        let mut lc = lifecycle();
        lc.on_connect();

        assert_eq!(lc.set_visible(false), LifecycleAction::Disconnect);
        assert!(lc.is_suspended());
        assert!(!lc.is_editable());
        assert_eq!(lc.set_visible(false), LifecycleAction::Nothing);

        assert_eq!(lc.set_visible(true), LifecycleAction::Connect);
        assert_eq!(lc.status(), ConnectionStatus::Connecting);
        assert_eq!(lc.set_visible(true), LifecycleAction::Nothing);
    }

    #[test]
    fn test_visible_does_not_resume_explicit_disconnect() {
        let mut lc = lifecycle();
        lc.on_connect();
        lc.disconnect();
        assert_eq!(lc.set_visible(false), LifecycleAction::Nothing);
        assert_eq!(lc.set_visible(true), LifecycleAction::Nothing);
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
    }
}
