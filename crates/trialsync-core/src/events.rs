//! Cross-component trial notifications (start, expiry, sync).

use tokio::sync::broadcast;

use crate::state::TrialState;

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialEvent {
    Started(TrialState),
    /// A start attempt was rejected; carries the status text shown to the user.
    StartFailed(String),
    Expired,
    Cleared,
    Synced { active: bool },
}

/// Broadcast bus. Publishing with no listeners is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TrialEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: TrialEvent) {
        tracing::debug!(?event, "trial event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrialEvent> {
        self.tx.subscribe()
    }
}
