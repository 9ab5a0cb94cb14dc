//! Line commands accepted on stdin.

use std::str::FromStr;

use fastnow_connectivity::NetworkSignal;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Forward a network hint to the monitor.
    Signal(NetworkSignal),
    /// Reset backoff and probe now.
    Retry,
    /// Print connection state and queue depth.
    Status,
    /// Run a drain pass and print its report.
    Drain,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command {0:?} (expected online, offline, focus, retry, status or drain)")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Command::Signal(NetworkSignal::Online)),
            "offline" => Ok(Command::Signal(NetworkSignal::Offline)),
            "focus" => Ok(Command::Signal(NetworkSignal::FocusGained)),
            "retry" => Ok(Command::Retry),
            "status" => Ok(Command::Status),
            "drain" => Ok(Command::Drain),
            _ => Err(UnknownCommand(s.trim().to_string())),
        }
    }
}
