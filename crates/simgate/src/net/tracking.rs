use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::protocol::sequence_greater_than;

#[derive(Debug, Clone)]
pub struct UnackedPacket {
    pub sequence: u32,
    pub data: Vec<u8>,
    pub send_time: Instant,
}

/// Reliable packets awaiting acknowledgement, keyed by sequence number.
///
/// Touched by the receive path (acks) and the transmit task (inserts) at the
/// same time, hence the sharded map.
#[derive(Debug, Default)]
pub struct UnackedPackets {
    pending: DashMap<u32, UnackedPacket>,
}

impl UnackedPackets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_packet(&self, sequence: u32, data: Vec<u8>) {
        self.pending.insert(
            sequence,
            UnackedPacket {
                sequence,
                data,
                send_time: Instant::now(),
            },
        );
    }

    /// Removes the entry for `sequence`, returning the round trip if it was
    /// still outstanding.
    pub fn process_ack(&self, sequence: u32) -> Option<Duration> {
        self.pending
            .remove(&sequence)
            .map(|(_, packet)| packet.send_time.elapsed())
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.pending.contains_key(&sequence)
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.len()
    }

    pub fn oldest_sequence(&self) -> Option<u32> {
        self.pending
            .iter()
            .map(|entry| *entry.key())
            .reduce(|oldest, seq| {
                if sequence_greater_than(oldest, seq) {
                    seq
                } else {
                    oldest
                }
            })
    }

    pub fn clear(&self) {
        self.pending.clear();
    }
}

#[derive(Debug)]
struct PendingAckState {
    sequences: VecDeque<u32>,
    last_flush: Instant,
}

/// Inbound reliable sequence numbers owed to the peer.
#[derive(Debug)]
pub struct PendingAcks {
    state: Mutex<PendingAckState>,
    flush_interval: Duration,
    max_per_message: usize,
}

impl PendingAcks {
    pub fn new(flush_interval: Duration, max_per_message: usize) -> Self {
        Self {
            state: Mutex::new(PendingAckState {
                sequences: VecDeque::new(),
                last_flush: Instant::now(),
            }),
            flush_interval,
            max_per_message: max_per_message.max(1),
        }
    }

    pub fn push(&self, sequence: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.sequences.push_back(sequence);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.sequences.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every pending ack into batches, at most once per flush interval.
    pub fn flush(&self, now: Instant) -> Vec<Vec<u32>> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };

        if state.sequences.is_empty()
            || now.saturating_duration_since(state.last_flush) < self.flush_interval
        {
            return Vec::new();
        }
        state.last_flush = now;

        let mut batches = Vec::new();
        while !state.sequences.is_empty() {
            let take = state.sequences.len().min(self.max_per_message);
            batches.push(state.sequences.drain(..take).collect());
        }
        batches
    }
}

#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: u32,
    recent_sequences: VecDeque<u32>,
    max_recent: usize,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::with_window(256)
    }

    pub fn with_window(max_recent: usize) -> Self {
        Self {
            last_received: 0,
            recent_sequences: VecDeque::with_capacity(max_recent),
            max_recent,
        }
    }

    /// Returns false when `sequence` was already seen inside the window.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        if self.recent_sequences.contains(&sequence) {
            return false;
        }

        if self.recent_sequences.len() >= self.max_recent {
            self.recent_sequences.pop_front();
        }
        self.recent_sequences.push_back(sequence);

        if sequence_greater_than(sequence, self.last_received) {
            self.last_received = sequence;
        }

        true
    }

    pub fn last_received(&self) -> u32 {
        self.last_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_removes_unacked_packet() {
        let unacked = UnackedPackets::new();
        unacked.track_packet(5, vec![1, 2, 3]);
        unacked.track_packet(6, vec![4]);

        assert!(unacked.process_ack(5).is_some());
        assert!(!unacked.contains(5));
        assert!(unacked.contains(6));
        assert!(unacked.process_ack(5).is_none());
    }

    #[test]
    fn test_unacked_packet_retained_without_ack() {
        let unacked = UnackedPackets::new();
        unacked.track_packet(10, Vec::new());
        unacked.process_ack(11);

        assert!(unacked.contains(10));
        assert_eq!(unacked.unacked_count(), 1);
    }

    #[test]
    fn test_oldest_sequence_handles_wrap() {
        let unacked = UnackedPackets::new();
        unacked.track_packet(u32::MAX - 1, Vec::new());
        unacked.track_packet(2, Vec::new());

        assert_eq!(unacked.oldest_sequence(), Some(u32::MAX - 1));
    }

    #[test]
    fn test_pending_acks_batched_by_limit() {
        let acks = PendingAcks::new(Duration::from_secs(1), 100);
        for seq in 0..250 {
            acks.push(seq);
        }

        let later = Instant::now() + Duration::from_secs(2);
        let batches = acks.flush(later);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[2].len(), 50);
        assert_eq!(batches[0][0], 0);
        assert!(acks.is_empty());
    }

    #[test]
    fn test_pending_acks_flush_rate_limited() {
        let acks = PendingAcks::new(Duration::from_secs(1), 100);
        let start = Instant::now() + Duration::from_secs(2);
        acks.push(1);
        assert_eq!(acks.flush(start).len(), 1);

        acks.push(2);
        assert!(acks.flush(start + Duration::from_millis(500)).is_empty());
        assert_eq!(acks.flush(start + Duration::from_secs(1)).len(), 1);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = ReceiveTracker::new();

        assert!(tracker.record_received(1));
        assert!(!tracker.record_received(1));
        assert!(tracker.record_received(3));
        assert!(tracker.record_received(2));
        assert_eq!(tracker.last_received(), 3);
    }
}
