//! Liveness/readiness reporting for the dataplane driver.

use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

/// Snapshot published to health consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub live: bool,
    /// False until the first apply pass completed.
    pub ready: bool,
    /// Set while the dataplane keeps failing to converge.
    pub degraded: bool,
    pub consecutive_failures: u32,
}

/// Tracks pass outcomes and publishes [`HealthReport`]s on a watch channel.
#[derive(Debug)]
pub struct HealthReporter {
    tx: watch::Sender<HealthReport>,
    degraded_after: u32,
    consecutive_failures: u32,
    ready: bool,
    cleanup_failed: bool,
}

impl HealthReporter {
    pub fn new(degraded_after: u32) -> (Self, watch::Receiver<HealthReport>) {
        let (tx, rx) = watch::channel(HealthReport {
            live: true,
            ..HealthReport::default()
        });
        let reporter = Self {
            tx,
            degraded_after: degraded_after.max(1),
            consecutive_failures: 0,
            ready: false,
            cleanup_failed: false,
        };
        (reporter, rx)
    }

    /// Record the outcome of one apply pass.
    pub fn record_pass(&mut self, still_dirty: bool) {
        if still_dirty {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures == self.degraded_after {
                warn!(
                    failures = self.consecutive_failures,
                    "Dataplane keeps failing to converge"
                );
            }
        } else {
            self.consecutive_failures = 0;
        }
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn record_cleanup_failure(&mut self) {
        self.cleanup_failed = true;
    }

    pub fn current(&self) -> HealthReport {
        HealthReport {
            live: true,
            ready: self.ready,
            degraded: self.cleanup_failed || self.consecutive_failures >= self.degraded_after,
            consecutive_failures: self.consecutive_failures,
        }
    }

    /// Publish the current state.
    pub fn report(&self) {
        self.tx.send_replace(self.current());
    }
}
