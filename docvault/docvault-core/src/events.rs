use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum Event {
    Created { id: Uuid, parent: Uuid },
    Updated { id: Uuid },
    Renamed { id: Uuid, name: String },
    Moved { id: Uuid, new_parent: Uuid },
    Copied { id: Uuid, source: Uuid },
    Deleted { id: Uuid, physical: bool },
    Restored { id: Uuid },
    Locked { id: Uuid, owner: String },
    Unlocked { id: Uuid },
    Shared { id: Uuid, principal: String },
    Unshared { id: Uuid, principal: String },
    SessionOpened { user: String },
    SessionClosed { user: String },
    SessionEvicted { user: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; dropped when nobody listens.
    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
