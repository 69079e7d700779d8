use crate::types::CheckpointEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all checkpoint events; slow subscribers lag and drop
/// events rather than blocking the publisher.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<CheckpointEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: CheckpointEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CheckpointEvent> {
        self.tx.subscribe()
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
