//! Event publishing/subscription abstraction (mechanics only).
//!
//! UI layers subscribe to sync notifications here instead of polling the
//! outbox. The bus is transport-agnostic and makes minimal assumptions:
//!
//! - **Broadcast**: each subscription gets its own copy of every message
//! - **No persistence**: a subscriber that is not listening misses messages;
//!   the outbox itself is the source of truth for pending work
//! - **Best-effort**: publishing never blocks on slow subscribers

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

/// A subscription to an event stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe();
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => render(event),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
///
/// Messages arrive in the order the bus published them.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every message that is already buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Failure to publish a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
    /// Transport-specific failure.
    #[error("event bus transport error: {0}")]
    Transport(String),
}

/// Typed pub/sub abstraction.
///
/// The trait requires `Send + Sync`, so implementations can be shared across
/// tasks and published to concurrently.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
