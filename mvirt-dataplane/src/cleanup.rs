//! Background cleanup with bounded retries.
//!
//! Used for one-off housekeeping that must not block the coordinator, such
//! as purging leftovers of a previous run. The task reports how it ended
//! through a oneshot channel, so callers can surface a give-up in health
//! instead of retrying forever in the background.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every failed attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1 << shift).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Succeeded { attempts: u32 },
    GaveUp { attempts: u32, last_error: String },
}

impl CleanupOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CleanupOutcome::Succeeded { .. })
    }
}

/// Handle to a running cleanup task.
#[derive(Debug)]
pub struct CleanupHandle {
    name: String,
    rx: oneshot::Receiver<CleanupOutcome>,
}

impl CleanupHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the task to finish.
    pub async fn outcome(self) -> CleanupOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            // Sender dropped without a result: the task panicked or the
            // runtime is shutting down.
            Err(_) => CleanupOutcome::GaveUp {
                attempts: 0,
                last_error: "cleanup task aborted".to_string(),
            },
        }
    }
}

/// Spawn `op` on the runtime, retrying per `policy`.
pub fn spawn_cleanup<F, Fut, E>(
    name: impl Into<String>,
    policy: RetryPolicy,
    mut op: F,
) -> CleanupHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let name = name.into();
    let (tx, rx) = oneshot::channel();
    let task_name = name.clone();
    let max_attempts = policy.max_attempts.max(1);

    tokio::spawn(async move {
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match op().await {
                Ok(()) => {
                    info!(cleanup = %task_name, attempts = attempt, "Cleanup finished");
                    break CleanupOutcome::Succeeded { attempts: attempt };
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(
                        cleanup = %task_name,
                        attempts = attempt,
                        error = %e,
                        "Giving up on cleanup"
                    );
                    break CleanupOutcome::GaveUp {
                        attempts: attempt,
                        last_error: e.to_string(),
                    };
                }
                Err(e) => {
                    let delay = policy.backoff.delay(attempt);
                    debug!(
                        cleanup = %task_name,
                        attempt,
                        error = %e,
                        ?delay,
                        "Cleanup failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        // Nobody listening is fine.
        let _ = tx.send(outcome);
    });

    CleanupHandle { name, rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(100), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handle = spawn_cleanup(
            "flaky",
            RetryPolicy {
                max_attempts: 5,
                backoff: Backoff::Fixed(Duration::from_secs(1)),
            },
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { if n < 3 { Err("not yet") } else { Ok(()) } }
            },
        );

        assert_eq!(handle.name(), "flaky");
        assert_eq!(
            handle.outcome().await,
            CleanupOutcome::Succeeded { attempts: 3 }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handle = spawn_cleanup(
            "broken",
            RetryPolicy {
                max_attempts: 4,
                backoff: Backoff::Fixed(Duration::from_millis(10)),
            },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("permission denied") }
            },
        );

        let outcome = handle.outcome().await;
        assert_eq!(
            outcome,
            CleanupOutcome::GaveUp {
                attempts: 4,
                last_error: "permission denied".to_string(),
            }
        );
        assert!(!outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
