//! `fastnow-connectivity`: backend reachability and outbox replay.
//!
//! [`ConnectionMonitor`] decides whether the hosted backend is reachable by
//! actually probing it, backs off while it is not, and drains the outbox
//! when it comes back. [`HttpBackend`] is the production [`Backend`].

pub mod backend;
pub mod backoff;
pub mod config;
pub mod http;
pub mod monitor;
pub mod state;

pub use backend::{Backend, BackendError, ReplayOutcome, ReplayRequest};
pub use backoff::BackoffPolicy;
pub use config::{ConfigError, MonitorConfig, SyncConfig};
pub use http::HttpBackend;
pub use monitor::{ConnectionMonitor, DrainReport, DroppedOperation, MonitorError, ReplayError};
pub use state::{ConnectionState, ConnectionStatus, NetworkSignal};
