//! `fastnow-outbox`: durable queue of writes issued while the backend is
//! unreachable.
//!
//! Writes are appended as [`QueuedOperation`]s and replayed oldest first once
//! connectivity returns. Entities created offline carry a local placeholder
//! id; when their create call replays, the server-assigned id is recorded as
//! an [`IdMapping`] so later operations can resolve to it.

pub mod error;
pub mod outbox;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::OutboxError;
pub use outbox::Outbox;
pub use sqlite::SqliteOutboxStore;
pub use store::{InMemoryOutboxStore, OutboxStore};
pub use types::{FailureOutcome, IdMapping, NewOperation, QueuedOperation};
