//! Durable queue of writes waiting for the backend.

use std::sync::Arc;

use chrono::{Duration, Utc};
use fastnow_core::{EntityId, LocalId, OperationId, UserId};
use fastnow_events::{EventBus, InMemoryEventBus, SyncEvent};

use crate::error::OutboxError;
use crate::store::{InMemoryOutboxStore, OutboxStore};
use crate::types::{FailureOutcome, IdMapping, NewOperation, QueuedOperation};

/// Outbox handle.
///
/// Cheap to clone; clones share the same store and event bus.
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn OutboxStore>,
    events: Arc<dyn EventBus<SyncEvent>>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox").finish_non_exhaustive()
    }
}

impl Outbox {
    pub fn new(store: Arc<dyn OutboxStore>, events: Arc<dyn EventBus<SyncEvent>>) -> Self {
        Self { store, events }
    }

    /// Outbox over an in-memory store and a private bus (tests/dev).
    pub fn in_memory() -> Self {
        Self::new(
            InMemoryOutboxStore::arc(),
            Arc::new(InMemoryEventBus::<SyncEvent>::new()),
        )
    }

    /// Bus on which queue notifications are published.
    pub fn events(&self) -> &Arc<dyn EventBus<SyncEvent>> {
        &self.events
    }

    /// Durably queue a write and return its id.
    pub async fn enqueue(&self, new: NewOperation) -> Result<OperationId, OutboxError> {
        let op = QueuedOperation::from_new(new);
        self.store.insert(&op).await?;

        tracing::info!(
            operation_id = %op.id,
            entity = %op.entity,
            action = %op.action,
            "queued operation"
        );

        self.notify_queue_changed().await;
        Ok(op.id)
    }

    /// Every queued operation, oldest first.
    pub async fn list(&self) -> Result<Vec<QueuedOperation>, OutboxError> {
        self.store.list(None).await
    }

    /// Queued operations owned by `user_id`, oldest first.
    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<QueuedOperation>, OutboxError> {
        self.store.list(Some(user_id)).await
    }

    pub async fn pending_count(&self) -> Result<usize, OutboxError> {
        self.store.count().await
    }

    /// Remove an operation. Absent ids are a no-op.
    pub async fn remove(&self, id: OperationId) -> Result<(), OutboxError> {
        if self.store.remove(id).await? {
            tracing::debug!(operation_id = %id, "removed operation");
            self.notify_queue_changed().await;
        }
        Ok(())
    }

    /// Persist a mutated copy of a queued operation.
    pub async fn update(&self, op: &QueuedOperation) -> Result<(), OutboxError> {
        let stored = self
            .store
            .get(op.id)
            .await?
            .ok_or(OutboxError::NotFound(op.id))?;

        if op.attempts < stored.attempts {
            return Err(OutboxError::AttemptsDecreased {
                id: op.id,
                stored: stored.attempts,
                requested: op.attempts,
            });
        }

        self.store.update(op).await
    }

    /// Discard everything a user still has queued (e.g. on sign-out).
    pub async fn clear_user(&self, user_id: UserId) -> Result<usize, OutboxError> {
        let removed = self.store.remove_user(user_id).await?;
        if removed > 0 {
            tracing::info!(user_id = %user_id, removed, "cleared queued operations");
            self.notify_queue_changed().await;
        }
        Ok(removed)
    }

    /// Resolve a possibly-local id through the recorded mappings.
    ///
    /// Remote ids and unmapped local ids come back unchanged.
    pub async fn resolve_mapped_id(&self, id: &EntityId) -> Result<EntityId, OutboxError> {
        let EntityId::Local(local_id) = id else {
            return Ok(id.clone());
        };

        Ok(match self.store.get_mapping(*local_id).await? {
            Some(mapping) => EntityId::Remote(mapping.server_id),
            None => id.clone(),
        })
    }

    /// Record that `local_id` is known to the backend as `server_id`.
    pub async fn set_id_mapping(
        &self,
        local_id: LocalId,
        server_id: impl Into<String>,
    ) -> Result<(), OutboxError> {
        let mapping = IdMapping::new(local_id, server_id);
        self.store.put_mapping(&mapping).await?;
        tracing::debug!(local_id = %local_id, server_id = %mapping.server_id, "recorded id mapping");
        Ok(())
    }

    /// Delete mappings older than `retention`; returns how many went.
    pub async fn purge_mappings(&self, retention: Duration) -> Result<usize, OutboxError> {
        let purged = self
            .store
            .purge_mappings_before(Utc::now() - retention)
            .await?;
        if purged > 0 {
            tracing::info!(purged, "purged expired id mappings");
        }
        Ok(purged)
    }

    /// Finish a successfully replayed operation.
    ///
    /// Records the id mapping the replay produced (if any) before removing
    /// the operation, so later operations never see a gap.
    pub async fn complete(
        &self,
        op: &QueuedOperation,
        server_id: Option<&str>,
    ) -> Result<(), OutboxError> {
        if let (Some(local_id), Some(server_id)) = (op.created_local_id(), server_id) {
            self.set_id_mapping(local_id, server_id).await?;
        }
        self.remove(op.id).await
    }

    /// Account for a failed replay.
    ///
    /// An operation that already used `max_attempts` is removed and a
    /// [`SyncEvent::OperationDropped`] is published; otherwise its attempt
    /// count is bumped and the reason recorded.
    pub async fn record_failure(
        &self,
        op: &QueuedOperation,
        reason: &str,
        max_attempts: u32,
    ) -> Result<FailureOutcome, OutboxError> {
        if op.attempts >= max_attempts {
            tracing::warn!(
                operation_id = %op.id,
                entity = %op.entity,
                action = %op.action,
                attempts = op.attempts,
                error = %reason,
                "dropping operation after exhausting attempts"
            );

            self.remove(op.id).await?;
            self.publish(SyncEvent::OperationDropped {
                operation_id: op.id,
                entity: op.entity,
                action: op.action.clone(),
                reason: reason.to_string(),
            });
            return Ok(FailureOutcome::Dropped {
                attempts: op.attempts,
            });
        }

        let mut failed = op.clone();
        failed.attempts += 1;
        failed.last_error = Some(reason.to_string());
        self.update(&failed).await?;

        tracing::debug!(
            operation_id = %op.id,
            attempts = failed.attempts,
            error = %reason,
            "replay failed, operation stays queued"
        );

        Ok(FailureOutcome::Retrying {
            attempts: failed.attempts,
        })
    }

    /// Publish on the outbox bus; failures are logged, never returned.
    pub fn publish(&self, event: SyncEvent) {
        if let Err(err) = self.events.publish(event) {
            tracing::warn!(error = %err, "failed to publish sync event");
        }
    }

    async fn notify_queue_changed(&self) {
        match self.store.count().await {
            Ok(pending) => self.publish(SyncEvent::QueueChanged { pending }),
            Err(err) => tracing::warn!(error = %err, "failed to count queued operations"),
        }
    }
}
