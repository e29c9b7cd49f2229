//! Change notifications pushed to the UI layer.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::channel::ChannelKind;
use crate::validator::ValidationState;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    ValidationChanged {
        channel: ChannelKind,
        state: ValidationState,
    },
    HeadersChanged {
        channel: ChannelKind,
        columns: Vec<String>,
        fallback: bool,
    },
    ConfigSaved {
        channel: ChannelKind,
        persisted_id: String,
    },
    BatchStaged {
        channel: ChannelKind,
        start_row: u64,
        rows: usize,
    },
    BatchCleared {
        channel: ChannelKind,
    },
    Committed {
        channel: ChannelKind,
        accepted: u64,
        cursor: u64,
    },
    CommitFailed {
        channel: ChannelKind,
        error: String,
    },
    AutoSyncChanged {
        channel: ChannelKind,
        enabled: bool,
    },
    ChannelDeleted {
        channel: ChannelKind,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Fire and forget; having no subscribers is fine.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
