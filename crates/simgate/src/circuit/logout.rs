use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingLogout {
    reply_sequence: u32,
    sent_at: Instant,
}

/// Tracks the LogoutReply whose acknowledgement closes the circuit.
#[derive(Debug, Default)]
pub struct LogoutState {
    pending: Option<PendingLogout>,
}

impl LogoutState {
    pub fn begin(&mut self, reply_sequence: u32, now: Instant) {
        self.pending = Some(PendingLogout {
            reply_sequence,
            sent_at: now,
        });
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_reply_ack(&self, sequence: u32) -> bool {
        self.pending
            .is_some_and(|pending| pending.reply_sequence == sequence)
    }

    pub fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.pending
            .is_some_and(|pending| now.saturating_duration_since(pending.sent_at) >= timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logout_reply_ack_matches_sequence() {
        let now = Instant::now();
        let mut logout = LogoutState::default();
        assert!(!logout.is_reply_ack(7));

        logout.begin(7, now);
        assert!(logout.is_pending());
        assert!(logout.is_reply_ack(7));
        assert!(!logout.is_reply_ack(8));
    }

    #[test]
    fn test_logout_times_out() {
        let now = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut logout = LogoutState::default();
        assert!(!logout.timed_out(now + timeout, timeout));

        logout.begin(1, now);
        assert!(!logout.timed_out(now + Duration::from_secs(9), timeout));
        assert!(logout.timed_out(now + timeout, timeout));
    }
}
