//! Processing event stream.
//!
//! The engine publishes one [`ProcessingEvent`] per handled task. Consumers
//! hold an [`EventSubscription`] and call [`EventSubscription::unsubscribe`]
//! (or drop it) when they disconnect; publishing never blocks and is a no-op
//! when nobody listens.

use tokio::sync::broadcast;
use tracing::warn;

/// How a single processing attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The result hash matched the stored one; nothing was written.
    Unchanged,
    /// A successful result was persisted and stitched.
    Updated,
    /// The orchestrator failed; errors were persisted and stitched.
    Failed,
    /// The write was rejected because another location owns the entity.
    Conflict,
    /// A store or stitcher error interrupted the attempt.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingEvent {
    pub entity_id: String,
    pub entity_ref: String,
    pub outcome: ProcessingOutcome,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProcessingEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ProcessingEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct EventSubscription {
    rx: broadcast::Receiver<ProcessingEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the bus is gone. Events missed because the
    /// subscriber fell behind are skipped with a warning.
    pub async fn recv(&mut self) -> Option<ProcessingEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "processing event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
