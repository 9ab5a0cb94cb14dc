//! Probe interval backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Multiplicative backoff for the reachability probe.
///
/// The interval starts at `initial_interval`, is multiplied by `factor` after
/// every failed probe, never exceeds `max_interval`, and snaps back to
/// `initial_interval` on success.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub factor: f64,
    pub max_interval: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            factor: 2.0,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_interval: Duration, factor: f64, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            factor,
            max_interval,
        }
    }

    /// Interval to wait after another failure at `current`.
    pub fn next(&self, current: Duration) -> Duration {
        let grown = current.as_secs_f64() * self.factor.max(1.0);
        let capped = grown.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped).max(self.initial_interval.min(self.max_interval))
    }
}
