//! Outbox records.

use chrono::{DateTime, Utc};
use fastnow_core::{Action, Entity, EntityId, LocalId, OperationId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OutboxError;

/// A write waiting to be replayed against the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub entity: Entity,
    pub action: Action,
    pub user_id: UserId,
    /// Entity the write acts on, if it targets an existing (or locally created) row.
    pub target: Option<EntityId>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Replay attempts so far. Only ever increases.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    /// Materialize a new operation with a fresh id, stamped now.
    pub fn from_new(new: NewOperation) -> Self {
        Self {
            id: OperationId::new(),
            entity: new.entity,
            action: new.action,
            user_id: new.user_id,
            target: new.target,
            payload: new.payload,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Local placeholder this operation brings into existence when it replays.
    pub fn created_local_id(&self) -> Option<LocalId> {
        if !self.action.creates_entity() {
            return None;
        }
        self.target.as_ref().and_then(EntityId::as_local)
    }
}

/// Input to [`crate::Outbox::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub entity: Entity,
    pub action: Action,
    pub user_id: UserId,
    pub target: Option<EntityId>,
    pub payload: Value,
}

impl NewOperation {
    pub fn new(user_id: UserId, entity: Entity, action: Action) -> Self {
        Self {
            entity,
            action,
            user_id,
            target: None,
            payload: Value::Null,
        }
    }

    pub fn target(mut self, target: impl Into<EntityId>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attach a typed payload, rejecting values that do not serialize.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, OutboxError> {
        self.payload =
            serde_json::to_value(payload).map_err(|e| OutboxError::Payload(e.to_string()))?;
        Ok(self)
    }
}

/// Record that a locally created entity received a server id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub local_id: LocalId,
    pub server_id: String,
    pub created_at: DateTime<Utc>,
}

impl IdMapping {
    pub fn new(local_id: LocalId, server_id: impl Into<String>) -> Self {
        Self {
            local_id,
            server_id: server_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// What happened to an operation after a failed replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still queued, with the bumped attempt count.
    Retrying { attempts: u32 },
    /// Removed after exhausting its attempts.
    Dropped { attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_new_starts_clean() {
        let user = UserId::new();
        let op = QueuedOperation::from_new(
            NewOperation::new(user, Entity::FoodEntry, Action::Create).payload(json!({"kcal": 120})),
        );
        assert_eq!(op.attempts, 0);
        assert_eq!(op.last_error, None);
        assert_eq!(op.user_id, user);
        assert_eq!(op.payload, json!({"kcal": 120}));
    }

    #[test]
    fn created_local_id_only_for_creating_actions() {
        let local = LocalId::new();
        let start = QueuedOperation::from_new(
            NewOperation::new(UserId::new(), Entity::WalkingSession, Action::Start).target(local),
        );
        assert_eq!(start.created_local_id(), Some(local));

        let pause = QueuedOperation::from_new(
            NewOperation::new(UserId::new(), Entity::WalkingSession, Action::Pause).target(local),
        );
        assert_eq!(pause.created_local_id(), None);
    }

    #[test]
    fn with_payload_rejects_non_string_map_keys() {
        let mut bad = std::collections::HashMap::new();
        bad.insert((1, 2), "x");
        let err = NewOperation::new(UserId::new(), Entity::Profile, Action::Update)
            .with_payload(&bad)
            .unwrap_err();
        assert!(matches!(err, OutboxError::Payload(_)));
    }
}
