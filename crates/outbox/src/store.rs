//! Outbox storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fastnow_core::{LocalId, OperationId, UserId};

use crate::error::OutboxError;
use crate::types::{IdMapping, QueuedOperation};

/// Durable home of queued operations and id mappings.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new operation.
    async fn insert(&self, op: &QueuedOperation) -> Result<(), OutboxError>;

    /// Operations oldest first, optionally scoped to one user.
    ///
    /// Operations with equal `created_at` come back in insertion order.
    async fn list(&self, user_id: Option<UserId>) -> Result<Vec<QueuedOperation>, OutboxError>;

    async fn get(&self, id: OperationId) -> Result<Option<QueuedOperation>, OutboxError>;

    /// Overwrite a queued operation. Fails with `NotFound` if it is gone.
    async fn update(&self, op: &QueuedOperation) -> Result<(), OutboxError>;

    /// Delete an operation; returns whether anything was removed.
    async fn remove(&self, id: OperationId) -> Result<bool, OutboxError>;

    /// Delete every operation owned by `user_id`; returns how many.
    async fn remove_user(&self, user_id: UserId) -> Result<usize, OutboxError>;

    async fn count(&self) -> Result<usize, OutboxError>;

    async fn get_mapping(&self, local_id: LocalId) -> Result<Option<IdMapping>, OutboxError>;

    /// Record a mapping.
    ///
    /// Re-recording the same pair is a no-op; a different server id for an
    /// already mapped local id is a `MappingConflict`.
    async fn put_mapping(&self, mapping: &IdMapping) -> Result<(), OutboxError>;

    /// Delete mappings created before `cutoff`; returns how many.
    async fn purge_mappings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OutboxError>;
}

/// In-memory outbox store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    // Kept in insertion order; `list` sorts stably by `created_at`.
    operations: RwLock<Vec<QueuedOperation>>,
    mappings: RwLock<HashMap<LocalId, IdMapping>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> OutboxError {
    OutboxError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, op: &QueuedOperation) -> Result<(), OutboxError> {
        let mut ops = self.operations.write().map_err(poisoned)?;
        if ops.iter().any(|o| o.id == op.id) {
            return Err(OutboxError::Storage(format!("duplicate operation id {}", op.id)));
        }
        ops.push(op.clone());
        Ok(())
    }

    async fn list(&self, user_id: Option<UserId>) -> Result<Vec<QueuedOperation>, OutboxError> {
        let ops = self.operations.read().map_err(poisoned)?;
        let mut result: Vec<_> = ops
            .iter()
            .filter(|o| user_id.is_none_or(|u| o.user_id == u))
            .cloned()
            .collect();

        // Stable sort keeps insertion order for equal timestamps.
        result.sort_by_key(|o| o.created_at);
        Ok(result)
    }

    async fn get(&self, id: OperationId) -> Result<Option<QueuedOperation>, OutboxError> {
        let ops = self.operations.read().map_err(poisoned)?;
        Ok(ops.iter().find(|o| o.id == id).cloned())
    }

    async fn update(&self, op: &QueuedOperation) -> Result<(), OutboxError> {
        let mut ops = self.operations.write().map_err(poisoned)?;
        let slot = ops
            .iter_mut()
            .find(|o| o.id == op.id)
            .ok_or(OutboxError::NotFound(op.id))?;
        *slot = op.clone();
        Ok(())
    }

    async fn remove(&self, id: OperationId) -> Result<bool, OutboxError> {
        let mut ops = self.operations.write().map_err(poisoned)?;
        let before = ops.len();
        ops.retain(|o| o.id != id);
        Ok(ops.len() != before)
    }

    async fn remove_user(&self, user_id: UserId) -> Result<usize, OutboxError> {
        let mut ops = self.operations.write().map_err(poisoned)?;
        let before = ops.len();
        ops.retain(|o| o.user_id != user_id);
        Ok(before - ops.len())
    }

    async fn count(&self) -> Result<usize, OutboxError> {
        Ok(self.operations.read().map_err(poisoned)?.len())
    }

    async fn get_mapping(&self, local_id: LocalId) -> Result<Option<IdMapping>, OutboxError> {
        let mappings = self.mappings.read().map_err(poisoned)?;
        Ok(mappings.get(&local_id).cloned())
    }

    async fn put_mapping(&self, mapping: &IdMapping) -> Result<(), OutboxError> {
        let mut mappings = self.mappings.write().map_err(poisoned)?;
        match mappings.get(&mapping.local_id) {
            Some(existing) if existing.server_id == mapping.server_id => Ok(()),
            Some(existing) => Err(OutboxError::MappingConflict {
                local_id: mapping.local_id,
                existing: existing.server_id.clone(),
                requested: mapping.server_id.clone(),
            }),
            None => {
                mappings.insert(mapping.local_id, mapping.clone());
                Ok(())
            }
        }
    }

    async fn purge_mappings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OutboxError> {
        let mut mappings = self.mappings.write().map_err(poisoned)?;
        let before = mappings.len();
        mappings.retain(|_, m| m.created_at >= cutoff);
        Ok(before - mappings.len())
    }
}
