use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::{RequestId, RequestStatus};

/// Events published by the dispatcher. Subscribers that lag lose the oldest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A chunk finished; `current` is 1-based. `id` is set for queued
    /// requests and `result` holds that chunk's output.
    ChunkProgress {
        id: Option<RequestId>,
        current: usize,
        total: usize,
        percentage: u8,
        result: serde_json::Value,
    },
    /// A queued request changed status.
    Request { id: RequestId, status: RequestStatus },
}

const EVENT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DispatchEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.tx.subscribe()
    }

    /// Publish; having no subscribers is not an error.
    pub fn publish(&self, event: DispatchEvent) {
        let _ = self.tx.send(event);
    }
}
