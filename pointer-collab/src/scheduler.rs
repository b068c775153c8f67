//! Coalescing save debounce.
//!
//! Every significant change pushes the deadline out to `now + window`, so a
//! burst of edits produces one save once the burst goes quiet. At most one
//! deadline exists per session.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct SaveScheduler {
    window: Duration,
    deadline: Option<Instant>,
}

impl SaveScheduler {
    pub fn new(window: Duration) -> Self {
        Self { window, deadline: None }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Change the debounce window. A pending deadline keeps its old value.
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Record a significant change; returns the new deadline.
    pub fn touch(&mut self, now: Instant) -> Instant {
        let deadline = now + self.window;
        self.deadline = Some(deadline);
        deadline
    }

    /// Drop the pending deadline. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// `true` (and disarmed) once the deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_deadline() {
        let mut scheduler = SaveScheduler::new(Duration::from_millis(2500));
        let start = Instant::now();
        scheduler.touch(start);
        let later = start + Duration::from_millis(2000);
        let deadline = scheduler.touch(later);
        assert_eq!(deadline, later + Duration::from_millis(2500));

        assert!(!scheduler.take_due(start + Duration::from_millis(2600)));
        assert!(scheduler.take_due(deadline));
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let mut scheduler = SaveScheduler::new(Duration::from_secs(3));
        assert!(!scheduler.cancel());
        scheduler.touch(Instant::now());
        assert!(scheduler.cancel());
        assert!(scheduler.deadline().is_none());
        assert!(!scheduler.take_due(Instant::now() + Duration::from_secs(10)));
    }

    #[test]
    fn test_set_window() {
        let mut scheduler = SaveScheduler::new(Duration::from_millis(2500));
        scheduler.set_window(Duration::from_secs(3));
        assert_eq!(scheduler.window(), Duration::from_secs(3));
    }
}
