//! Sync notifications and the bus that carries them.

pub mod bus;
pub mod in_memory_bus;
pub mod sync_event;

pub use bus::{BusError, EventBus, Subscription};
pub use in_memory_bus::InMemoryEventBus;
pub use sync_event::SyncEvent;
