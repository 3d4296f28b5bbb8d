use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::CircuitError;
use crate::net::{Message, Tier};

#[derive(Debug)]
pub enum Outbound {
    Message { message: Message, reliable: bool },
    /// Wakes the transmit task so it can observe shutdown.
    Stop,
}

impl Outbound {
    pub fn tier(&self) -> Tier {
        match self {
            Self::Message { message, .. } => message.kind().tier(),
            Self::Stop => Tier::High,
        }
    }
}

/// Producer side of the three per-tier transmit channels.
#[derive(Debug, Clone)]
pub struct TransmitQueue {
    senders: [mpsc::Sender<Outbound>; 3],
}

#[derive(Debug)]
pub struct TransmitReceiver {
    receivers: [mpsc::Receiver<Outbound>; 3],
}

pub fn transmit_queue(capacity: usize) -> (TransmitQueue, TransmitReceiver) {
    let capacity = capacity.max(1);
    let (high_tx, high_rx) = mpsc::channel(capacity);
    let (medium_tx, medium_rx) = mpsc::channel(capacity);
    let (low_tx, low_rx) = mpsc::channel(capacity);

    (
        TransmitQueue {
            senders: [high_tx, medium_tx, low_tx],
        },
        TransmitReceiver {
            receivers: [high_rx, medium_rx, low_rx],
        },
    )
}

impl TransmitQueue {
    /// Waits for room in the item's tier.
    pub async fn send(&self, item: Outbound) -> Result<(), CircuitError> {
        self.senders[item.tier().index()]
            .send(item)
            .await
            .map_err(|_| CircuitError::Closed)
    }

    pub fn try_send(&self, item: Outbound) -> Result<(), CircuitError> {
        let tier = item.tier();
        self.senders[tier.index()]
            .try_send(item)
            .map_err(|err| match err {
                TrySendError::Full(_) => CircuitError::QueueFull(tier),
                TrySendError::Closed(_) => CircuitError::Closed,
            })
    }

    pub fn len(&self, tier: Tier) -> usize {
        let sender = &self.senders[tier.index()];
        sender.max_capacity() - sender.capacity()
    }
}

impl TransmitReceiver {
    /// Takes one item from each non-empty tier in priority order, repeating
    /// until every tier is empty.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut batch = Vec::new();
        loop {
            let mut progressed = false;
            for receiver in &mut self.receivers {
                if let Ok(item) = receiver.try_recv() {
                    batch.push(item);
                    progressed = true;
                }
            }
            if !progressed {
                return batch;
            }
        }
    }

    /// Drains what is queued, or waits up to `wait` for something to arrive.
    /// An empty result means the wait elapsed with nothing queued.
    pub async fn next_pass(&mut self, wait: Duration) -> Vec<Outbound> {
        let batch = self.drain();
        if !batch.is_empty() {
            return batch;
        }

        let first = {
            let [high, medium, low] = &mut self.receivers;
            tokio::time::timeout(wait, async {
                tokio::select! {
                    biased;
                    Some(item) = high.recv() => Some(item),
                    Some(item) = medium.recv() => Some(item),
                    Some(item) = low.recv() => Some(item),
                    else => None,
                }
            })
            .await
        };

        match first {
            Ok(Some(item)) => {
                let mut batch = vec![item];
                batch.extend(self.drain());
                batch
            }
            Ok(None) => Vec::new(),
            Err(_) => Vec::new(),
        }
    }
}
