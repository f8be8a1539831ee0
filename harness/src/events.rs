use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Notifications emitted by a peer server as the system under test talks to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerEvent {
    KeysServed {
        key_id: String,
    },
    MakeJoinServed {
        origin: String,
        room_id: String,
        user_id: String,
    },
    JoinAccepted {
        origin: String,
        room_id: String,
        event_id: String,
    },
    AliasResolved {
        alias: String,
        room_id: String,
    },
    RequestRejected {
        path: String,
        errcode: String,
        reason: String,
    },
}

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast-based event bus; tests subscribe to await inbound traffic.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PeerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event to all subscribers. Returns the number of receivers.
    pub fn emit(&self, event: PeerEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Convenience: emit a RequestRejected event.
    pub fn emit_rejected(&self, path: &str, errcode: &str, reason: &str) -> usize {
        self.emit(PeerEvent::RequestRejected {
            path: path.to_string(),
            errcode: errcode.to_string(),
            reason: reason.to_string(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
