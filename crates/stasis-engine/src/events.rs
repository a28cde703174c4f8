use std::path::PathBuf;

use stasis_types::ScopeTag;
use tokio::sync::broadcast;
use tracing::trace;

/// Notifications raised for presentation layers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistenceEvent {
    SaveCompleted { path: PathBuf, records: usize },
    LoadCompleted { path: PathBuf, objects: usize },
    ScopeRestored { scope: ScopeTag, parts: usize },
    /// A save or restore failed; the message is the error's display form.
    Failed { operation: &'static str, message: String },
}

/// A broadcast receiver for persistence events.
pub type EventStream = broadcast::Receiver<PersistenceEvent>;

/// Fan-out of [`PersistenceEvent`]s to any number of subscribers.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<PersistenceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventStream {
        self.sender.subscribe()
    }

    /// Deliver `event` to current subscribers. Having none is not an error.
    pub fn publish(&self, event: PersistenceEvent) {
        if self.sender.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
