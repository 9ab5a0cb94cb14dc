//! Remote side of the sync: reachability probe and operation replay.

use async_trait::async_trait;
use fastnow_core::{Action, Entity, OperationId, UserId};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A queued operation ready to be sent, with its target already resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayRequest {
    pub operation_id: OperationId,
    pub entity: Entity,
    pub action: Action,
    pub user_id: UserId,
    /// Server id of the row acted on. `None` for creates and untargeted calls.
    pub target: Option<String>,
    pub payload: Value,
}

/// What the backend reported back for a successful replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Id assigned to a newly created row.
    pub server_id: Option<String>,
}

impl ReplayOutcome {
    pub fn created(server_id: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The request never reached the backend (DNS, refused, reset).
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    /// The backend answered but cannot serve right now (408/429/5xx).
    #[error("backend unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },
    /// The backend refused the request itself (validation, auth, missing row).
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The request could not be built or the response was not understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// The backend could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BackendError::Transport(_) | BackendError::Timeout)
    }

    /// Retrying later may succeed without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Transport(_) | BackendError::Timeout | BackendError::Unavailable { .. }
        )
    }
}

/// Backend the outbox replays against.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Cheap read proving the backend is reachable.
    async fn probe(&self) -> Result<(), BackendError>;

    /// Perform the write described by `request`.
    async fn replay(&self, request: &ReplayRequest) -> Result<ReplayOutcome, BackendError>;
}
