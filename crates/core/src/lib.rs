//! `fastnow-core`: identifiers and tags shared by the sync crates.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod tag;

pub use error::DomainError;
pub use id::{EntityId, LocalId, OperationId, UserId};
pub use tag::{Action, Entity};
