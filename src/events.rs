use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::LifecycleEvent;

/// Lifecycle event fan-out to downstream consumers (position tracking, reporting)
#[derive(Clone)]
pub struct EventBus {
    event_tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: LifecycleEvent) {
        info!(topic = event.topic(), intent_id = event.intent_id(), "Lifecycle event");
        if let Err(e) = self.event_tx.send(event) {
            debug!(topic = e.0.topic(), "No lifecycle subscribers");
        }
    }
}
