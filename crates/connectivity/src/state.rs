//! Connectivity state of the client.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

/// Backend reachability as last established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No probe has completed yet.
    Unknown,
    /// The last probe reached the backend.
    Connected,
    /// The last probe failed, or the network went away.
    Disconnected,
}

/// Platform hints about the network. Never proof of reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkSignal {
    Online,
    Offline,
    FocusGained,
}

/// Snapshot of what the monitor knows about connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Network-level flag from platform signals.
    pub is_online: bool,
    /// Set only by a successful probe round trip.
    pub is_connected: bool,
    pub retry_count: u32,
    pub current_interval: Duration,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn new(policy: &BackoffPolicy) -> Self {
        Self {
            status: ConnectionStatus::Unknown,
            is_online: true,
            is_connected: false,
            retry_count: 0,
            current_interval: policy.initial_interval,
            last_connected_at: None,
            last_checked_at: None,
            last_error: None,
        }
    }

    /// Apply a successful probe. Returns `true` when this is a transition
    /// into the connected state.
    pub(crate) fn record_success(&mut self, policy: &BackoffPolicy) -> bool {
        let now = Utc::now();
        let transitioned = !self.is_connected;

        self.status = ConnectionStatus::Connected;
        self.is_connected = true;
        self.is_online = true;
        self.retry_count = 0;
        self.current_interval = policy.initial_interval;
        self.last_connected_at = Some(now);
        self.last_checked_at = Some(now);
        self.last_error = None;

        transitioned
    }

    /// Apply a failed probe. Returns `true` when connectivity was lost.
    pub(crate) fn record_failure(&mut self, policy: &BackoffPolicy, error: String) -> bool {
        let lost = self.is_connected;

        self.status = ConnectionStatus::Disconnected;
        self.is_connected = false;
        self.retry_count = self.retry_count.saturating_add(1);
        self.current_interval = policy.next(self.current_interval);
        self.last_checked_at = Some(Utc::now());
        self.last_error = Some(error);

        lost
    }

    /// Mark the backend unreachable without counting a probe failure.
    /// Returns `true` when connectivity was lost.
    pub(crate) fn mark_disconnected(&mut self, error: Option<String>) -> bool {
        let lost = self.is_connected;
        self.status = ConnectionStatus::Disconnected;
        self.is_connected = false;
        if error.is_some() {
            self.last_error = error;
        }
        lost
    }

    /// Network went away.
    pub(crate) fn go_offline(&mut self) -> bool {
        self.is_online = false;
        self.mark_disconnected(Some("network offline".to_string()))
    }

    pub(crate) fn reset_backoff(&mut self, policy: &BackoffPolicy) {
        self.retry_count = 0;
        self.current_interval = policy.initial_interval;
    }
}
