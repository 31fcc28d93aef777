use std::time::Duration;

use tokio::time::Instant;

/// Liveness bookkeeping for one open socket.
///
/// The driver owns the ping ticker; this only remembers the outstanding
/// ping so a missing pong can be turned into a deadline when enforcement
/// is configured.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    pong_timeout: Option<Duration>,
    awaiting_since: Option<Instant>,
    last_rtt: Option<Duration>,
}

impl Heartbeat {
    pub fn new(interval: Duration, pong_timeout: Option<Duration>) -> Self {
        Self {
            interval,
            pong_timeout,
            awaiting_since: None,
            last_rtt: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ping_sent(&mut self, now: Instant) {
        // Keep the oldest unanswered ping so the deadline cannot slide.
        if self.awaiting_since.is_none() {
            self.awaiting_since = Some(now);
        }
    }

    /// Records a pong; returns the round trip when a ping was outstanding.
    pub fn pong_received(&mut self, now: Instant) -> Option<Duration> {
        let sent = self.awaiting_since.take()?;
        let rtt = now.saturating_duration_since(sent);
        self.last_rtt = Some(rtt);
        Some(rtt)
    }

    /// When the outstanding ping expires, if enforcement is on.
    pub fn pong_deadline(&self) -> Option<Instant> {
        Some(self.awaiting_since? + self.pong_timeout?)
    }

    pub fn pong_timeout(&self) -> Option<Duration> {
        self.pong_timeout
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn reset(&mut self) {
        self.awaiting_since = None;
    }
}
