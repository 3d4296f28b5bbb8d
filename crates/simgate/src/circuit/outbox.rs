use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;

use super::CircuitError;
use crate::net::Message;

/// Outcome of one long poll against the outbox.
#[derive(Debug)]
pub enum Dequeued {
    Event { id: u64, message: Message },
    Disabled,
    TimedOut,
}

/// Messages waiting for the client's next EventQueueGet poll.
#[derive(Debug)]
pub struct EventOutbox {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    enabled: AtomicBool,
    disabled: Notify,
    next_id: AtomicU64,
}

impl EventOutbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            enabled: AtomicBool::new(true),
            disabled: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn push(&self, message: Message) -> Result<(), CircuitError> {
        self.tx.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => CircuitError::EventQueueFull,
            TrySendError::Closed(_) => CircuitError::Closed,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.disabled.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `attempts` waits of `wait` each, all inside one deadline fixed
    /// at entry. Time spent queued behind another poll counts against it.
    /// Disabling the outbox ends the poll at once.
    pub async fn dequeue(&self, attempts: u32, wait: Duration) -> Dequeued {
        let deadline = Instant::now() + wait * attempts;
        let disabled = self.disabled.notified();
        tokio::pin!(disabled);
        if !self.is_enabled() {
            return Dequeued::Disabled;
        }

        let poll = async {
            let mut rx = self.rx.lock().await;
            for _ in 0..attempts {
                match tokio::time::timeout(wait, rx.recv()).await {
                    Ok(Some(message)) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        return Dequeued::Event { id, message };
                    }
                    Ok(None) => return Dequeued::Disabled,
                    Err(_) => continue,
                }
            }
            Dequeued::TimedOut
        };

        tokio::select! {
            biased;
            _ = &mut disabled => Dequeued::Disabled,
            result = tokio::time::timeout_at(deadline, poll) => {
                result.unwrap_or(Dequeued::TimedOut)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_after_attempts() {
        let outbox = EventOutbox::new(4);
        let started = tokio::time::Instant::now();

        let result = outbox.dequeue(30, Duration::from_secs(1)).await;

        assert!(matches!(result, Dequeued::TimedOut));
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_returns_queued_event() {
        let outbox = EventOutbox::new(4);
        outbox.push(Message::alert("first")).unwrap();
        outbox.push(Message::alert("second")).unwrap();

        let first = outbox.dequeue(30, Duration::from_secs(1)).await;
        let second = outbox.dequeue(30, Duration::from_secs(1)).await;

        assert!(matches!(first, Dequeued::Event { id: 1, .. }));
        assert!(matches!(second, Dequeued::Event { id: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_outbox_reports_disabled() {
        let outbox = EventOutbox::new(4);
        outbox.push(Message::alert("queued")).unwrap();
        outbox.set_enabled(false);

        assert!(matches!(
            outbox.dequeue(30, Duration::from_secs(1)).await,
            Dequeued::Disabled
        ));
    }

    #[test]
    fn test_push_reports_full() {
        let outbox = EventOutbox::new(1);
        outbox.push(Message::alert("a")).unwrap();
        assert!(matches!(
            outbox.push(Message::alert("b")),
            Err(CircuitError::EventQueueFull)
        ));
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_polls_share_the_window() {
        let outbox = EventOutbox::new(4);
        let started = Instant::now();

        let (first, second) = tokio::join!(
            outbox.dequeue(30, Duration::from_secs(1)),
            outbox.dequeue(30, Duration::from_secs(1))
        );

        assert!(matches!(first, Dequeued::TimedOut));
        assert!(matches!(second, Dequeued::TimedOut));
        assert!(started.elapsed() <= Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_ends_poll_immediately() {
        let outbox = std::sync::Arc::new(EventOutbox::new(4));
        let poller = outbox.clone();
        let started = Instant::now();
        let poll = tokio::spawn(async move { poller.dequeue(30, Duration::from_secs(1)).await });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        outbox.set_enabled(false);
        let result = poll.await.unwrap();

        assert!(matches!(result, Dequeued::Disabled));
        assert!(started.elapsed() < Duration::from_millis(1600));
    }
}
