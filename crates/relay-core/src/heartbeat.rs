//! Liveness tracking shared by the gateway's idle check and the connector's
//! heartbeat.
//!
//! A check sends a PING and then waits for traffic. Any inbound frame counts,
//! not only the PONG, so a busy connection never trips the timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Check cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between PINGs.
    pub interval: Duration,
    /// Time after a PING without any inbound frame before the transport is closed.
    pub timeout: Duration,
}

impl HeartbeatConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(crate::defaults::CLIENT_HEARTBEAT_INTERVAL_MS),
            timeout: Duration::from_millis(crate::defaults::CLIENT_HEARTBEAT_TIMEOUT_MS),
        }
    }
}

/// Counts inbound frames and lets a check wait for the next one.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    seen: AtomicU64,
    notify: Notify,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound frame.
    pub fn touch(&self) {
        self.seen.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Frames seen so far.
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for a frame newer than the `since` mark.
    ///
    /// Returns `true` as soon as traffic is observed, `false` on expiry.
    pub async fn wait_for_traffic(&self, since: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.seen() != since {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.seen() != since;
            }
        }
    }
}
