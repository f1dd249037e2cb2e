//! Edge-triggered countdown timer.
//!
//! A [`TickTimer`] is polled, not awaited: the event loop checks it once per
//! iteration after receive processing. Expiry reports true exactly once and
//! stops the timer, so one deadline produces one Timeout event.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct TickTimer {
    deadline: Option<Instant>,
}

impl TickTimer {
    pub fn stopped() -> TickTimer {
        TickTimer { deadline: None }
    }

    /// (Re)arms the timer. Any previous deadline is discarded.
    pub fn start(&mut self, ttl: Duration) {
        self.deadline = Some(Instant::now() + ttl);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// True exactly once per expiry; the expired deadline is consumed.
    pub fn expired(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn does_not_fire_before_deadline() {
        let mut t = TickTimer::stopped();
        t.start(Duration::from_secs(3));
        advance(Duration::from_secs(2)).await;
        assert!(!t.expired());
        assert!(t.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_once() {
        let mut t = TickTimer::stopped();
        t.start(Duration::from_secs(3));
        advance(Duration::from_secs(4)).await;
        assert!(t.expired());
        assert!(!t.expired());
        assert!(!t.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_deadline() {
        let mut t = TickTimer::stopped();
        t.start(Duration::from_secs(3));
        advance(Duration::from_secs(2)).await;
        t.start(Duration::from_secs(3));
        advance(Duration::from_secs(2)).await;
        assert!(!t.expired());
        advance(Duration::from_secs(1)).await;
        assert!(t.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_timer_never_fires() {
        let mut t = TickTimer::stopped();
        advance(Duration::from_secs(10)).await;
        assert!(!t.expired());
        t.start(Duration::from_secs(1));
        t.stop();
        advance(Duration::from_secs(10)).await;
        assert!(!t.expired());
    }
}
