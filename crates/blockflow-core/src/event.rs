use tokio::sync::broadcast;

use crate::types::FlowEvent;

/// Fan-out channel for engine events (live updates, failures, lifecycle).
///
/// Publishing never waits: slow receivers lag and lose the oldest events.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    /// Whether anyone is listening. Lets publishers skip serialization.
    pub fn has_receivers(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
