use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::ObjectUpdate;
use crate::net::Message;

/// Wire value meaning "no time dilation applied".
pub const TIME_DILATION_NONE: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    Physical,
    NonPhysical,
    Kill,
    Dropped,
}

#[derive(Debug, Default)]
struct SchedulerState {
    physical: VecDeque<ObjectUpdate>,
    nonphysical: VecDeque<ObjectUpdate>,
    last_serials: HashMap<u32, u64>,
}

/// Pending replication changes for one circuit.
#[derive(Debug)]
pub struct UpdateScheduler {
    state: Mutex<SchedulerState>,
    signaled: AtomicBool,
    kill_batch_size: usize,
}

impl UpdateScheduler {
    pub fn new(kill_batch_size: usize) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            signaled: AtomicBool::new(false),
            kill_batch_size: kill_batch_size.max(1),
        }
    }

    pub fn schedule(&self, update: ObjectUpdate) -> Scheduled {
        if update.killed && update.physics {
            return Scheduled::Dropped;
        }

        let Ok(mut state) = self.state.lock() else {
            return Scheduled::Dropped;
        };

        if update.killed {
            state.nonphysical.push_back(update);
            Scheduled::Kill
        } else if update.physics {
            state.physical.push_back(update);
            Scheduled::Physical
        } else {
            state.nonphysical.push_back(update);
            Scheduled::NonPhysical
        }
    }

    /// Returns true for the caller that should wake the consumer.
    pub fn mark_signaled(&self) -> bool {
        !self.signaled.swap(true, Ordering::AcqRel)
    }

    pub fn clear_signal(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn physical_len(&self) -> usize {
        self.state.lock().map(|s| s.physical.len()).unwrap_or(0)
    }

    pub fn nonphysical_len(&self) -> usize {
        self.state.lock().map(|s| s.nonphysical.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.physical_len() == 0 && self.nonphysical_len() == 0
    }

    /// Turns everything queued into outbound messages, alternating between
    /// the physical and non-physical queues.
    pub fn drain(&self, region_handle: u64) -> Vec<Message> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };

        let mut messages = Vec::new();
        let mut kills = Vec::new();

        loop {
            let physical = state.physical.pop_front();
            let nonphysical = state.nonphysical.pop_front();
            if physical.is_none() && nonphysical.is_none() {
                break;
            }

            for update in physical.into_iter().chain(nonphysical) {
                if update.killed {
                    state.last_serials.remove(&update.local_id);
                    kills.push(update.local_id);
                    if kills.len() >= self.kill_batch_size {
                        messages.push(Message::KillObject {
                            local_ids: std::mem::take(&mut kills),
                        });
                    }
                    continue;
                }

                let previous = state.last_serials.insert(update.local_id, update.serial);
                if previous == Some(update.serial) {
                    messages.push(Message::ImprovedTerseObjectUpdate {
                        region_handle,
                        time_dilation: TIME_DILATION_NONE,
                        objects: vec![update.state.terse_data()],
                    });
                } else {
                    messages.push(Message::ObjectUpdate {
                        region_handle,
                        time_dilation: TIME_DILATION_NONE,
                        objects: vec![update.state.full_data()],
                    });
                }
            }
        }

        if !kills.is_empty() {
            messages.push(Message::KillObject { local_ids: kills });
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::update::ObjectState;

    fn update(local_id: u32, serial: u64) -> ObjectUpdate {
        ObjectUpdate::new(Arc::new(ObjectState::new(local_id, Uuid::new_v4())), serial)
    }

    #[test]
    fn test_killed_physical_update_dropped() {
        let scheduler = UpdateScheduler::new(250);

        let outcome = scheduler.schedule(update(1, 1).physical().killed());

        assert_eq!(outcome, Scheduled::Dropped);
        assert_eq!(scheduler.physical_len(), 0);
        assert!(scheduler.drain(0).is_empty());
    }

    #[test]
    fn test_updates_routed_by_physics_flag() {
        let scheduler = UpdateScheduler::new(250);

        assert_eq!(scheduler.schedule(update(1, 1).physical()), Scheduled::Physical);
        assert_eq!(scheduler.schedule(update(2, 1)), Scheduled::NonPhysical);
        assert_eq!(scheduler.schedule(update(3, 1).killed()), Scheduled::Kill);

        assert_eq!(scheduler.physical_len(), 1);
        assert_eq!(scheduler.nonphysical_len(), 2);
    }

    #[test]
    fn test_unchanged_serial_sends_terse() {
        let scheduler = UpdateScheduler::new(250);

        scheduler.schedule(update(7, 3));
        let first = scheduler.drain(99);
        scheduler.schedule(update(7, 3));
        let second = scheduler.drain(99);
        scheduler.schedule(update(7, 4));
        let third = scheduler.drain(99);

        assert!(matches!(
            first.as_slice(),
            [Message::ObjectUpdate { region_handle: 99, time_dilation: TIME_DILATION_NONE, .. }]
        ));
        assert!(matches!(
            second.as_slice(),
            [Message::ImprovedTerseObjectUpdate { time_dilation: TIME_DILATION_NONE, .. }]
        ));
        assert!(matches!(third.as_slice(), [Message::ObjectUpdate { .. }]));
    }

    #[test]
    fn test_kills_batched() {
        let scheduler = UpdateScheduler::new(250);
        for local_id in 0..300 {
            scheduler.schedule(update(local_id, 1).killed());
        }

        let messages = scheduler.drain(0);
        let batches: Vec<&Vec<u32>> = messages
            .iter()
            .filter_map(|message| match message {
                Message::KillObject { local_ids } => Some(local_ids),
                _ => None,
            })
            .collect();

        assert!(batches.len() >= 2);
        assert_eq!(batches[0].len(), 250);
        assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 300);
    }

    #[test]
    fn test_kill_resets_serial_tracking() {
        let scheduler = UpdateScheduler::new(250);
        scheduler.schedule(update(5, 1));
        scheduler.schedule(update(5, 1).killed());
        scheduler.drain(0);

        scheduler.schedule(update(5, 1));
        assert!(matches!(
            scheduler.drain(0).as_slice(),
            [Message::ObjectUpdate { .. }]
        ));
    }

    #[test]
    fn test_signal_taken_once() {
        let scheduler = UpdateScheduler::new(250);
        assert!(scheduler.mark_signaled());
        assert!(!scheduler.mark_signaled());
        scheduler.clear_signal();
        assert!(scheduler.mark_signaled());
    }
}
