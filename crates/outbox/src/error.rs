use fastnow_core::{LocalId, OperationId};
use thiserror::Error;

/// Outbox error.
#[derive(Debug, Clone, Error)]
pub enum OutboxError {
    #[error("operation not found: {0}")]
    NotFound(OperationId),
    #[error("payload is not serializable: {0}")]
    Payload(String),
    #[error("local id {local_id} already maps to {existing}, refusing {requested}")]
    MappingConflict {
        local_id: LocalId,
        existing: String,
        requested: String,
    },
    #[error("attempt count of {id} cannot go from {stored} to {requested}")]
    AttemptsDecreased {
        id: OperationId,
        stored: u32,
        requested: u32,
    },
    #[error("corrupt outbox row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for OutboxError {
    fn from(value: sqlx::Error) -> Self {
        Self::Storage(value.to_string())
    }
}
