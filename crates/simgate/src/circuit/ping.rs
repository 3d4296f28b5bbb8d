use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outstanding StartPingCheck ids and the latency they produced.
#[derive(Debug)]
pub struct PingTracker {
    next_id: u8,
    sent: HashMap<u8, Instant>,
    last_ping: Instant,
    latency: Duration,
}

impl PingTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            next_id: 0,
            sent: HashMap::new(),
            last_ping: now,
            latency: Duration::ZERO,
        }
    }

    pub fn is_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_ping) >= interval
    }

    /// Allocates the next ping id and remembers when it went out.
    pub fn start(&mut self, now: Instant) -> u8 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.sent.insert(id, now);
        self.last_ping = now;
        id
    }

    /// Records the reply for `id`. Latency is half the round trip and never
    /// negative, even if the clock reading predates the send.
    pub fn complete(&mut self, id: u8, now: Instant) -> Option<Duration> {
        let sent = self.sent.remove(&id)?;
        self.latency = now.saturating_duration_since(sent) / 2;
        Some(self.latency)
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn outstanding(&self) -> usize {
        self.sent.len()
    }
}
