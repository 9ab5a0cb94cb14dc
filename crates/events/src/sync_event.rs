//! Notifications emitted by the outbox and the connection monitor.

use fastnow_core::{Action, Entity, OperationId};
use serde::{Deserialize, Serialize};

/// Sync-related notification broadcast to UI layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// The number of queued operations changed.
    QueueChanged { pending: usize },

    /// A drain pass is starting.
    SyncStart { pending: usize },

    /// A drain pass finished.
    SyncComplete {
        replayed: usize,
        failed: usize,
        dropped: usize,
        blocked: usize,
    },

    /// An operation exhausted its attempts and was removed without replaying.
    OperationDropped {
        operation_id: OperationId,
        entity: Entity,
        action: Action,
        reason: String,
    },

    /// Backend reachability flipped.
    ConnectionChanged { connected: bool },
}

impl SyncEvent {
    /// Stable name, as used by UI listeners.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::QueueChanged { .. } => "queue_changed",
            SyncEvent::SyncStart { .. } => "sync_start",
            SyncEvent::SyncComplete { .. } => "sync_complete",
            SyncEvent::OperationDropped { .. } => "operation_dropped",
            SyncEvent::ConnectionChanged { .. } => "connection_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = SyncEvent::QueueChanged { pending: 3 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "queue_changed", "pending": 3 }));
        assert_eq!(event.name(), "queue_changed");
    }
}
