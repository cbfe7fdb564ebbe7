//! Timers used by the driver loop.
//!
//! Both timers keep their deadline in the struct rather than in a pending
//! future, so their `async` methods are safe to use as `tokio::select!`
//! branches: a dropped, unfinished wait is simply resumed next time.

use std::future::pending;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep_until};
use tracing::warn;

/// Periodic ticker whose period is extended by a random jitter on each tick,
/// so that many nodes don't hit the kernel (or the API) in lock-step.
#[derive(Debug)]
pub struct JitterTicker {
    period: Duration,
    jitter: Duration,
    deadline: Instant,
}

impl JitterTicker {
    pub fn new(period: Duration, jitter: Duration) -> Self {
        let mut ticker = Self {
            period,
            jitter,
            deadline: Instant::now(),
        };
        ticker.deadline = Instant::now() + ticker.next_delay();
        ticker
    }

    /// Ticker for an interval that may be disabled (`Duration::ZERO`).
    /// Uses a tenth of the period as jitter.
    pub fn optional(period: Duration) -> Option<Self> {
        if period.is_zero() {
            None
        } else {
            Some(Self::new(period, period / 10))
        }
    }

    /// Wait for the next tick.
    pub async fn tick(&mut self) {
        sleep_until(self.deadline).await;
        self.deadline = Instant::now() + self.next_delay();
    }

    fn next_delay(&self) -> Duration {
        let jitter_nanos = self.jitter.as_nanos() as u64;
        if jitter_nanos == 0 {
            return self.period;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_nanos);
        self.period + Duration::from_nanos(extra)
    }
}

/// Tick an optional ticker; never completes when the ticker is disabled.
pub async fn tick_optional(ticker: &mut Option<JitterTicker>) {
    match ticker {
        Some(t) => t.tick().await,
        None => pending::<()>().await,
    }
}

/// One-shot "kick me again after D" timer. Arming replaces any pending
/// deadline rather than stacking a second one.
#[derive(Debug, Default)]
pub struct RescheduleTimer {
    deadline: Option<Instant>,
}

impl RescheduleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A delay past the end of the clock leaves the timer disarmed.
    pub fn arm(&mut self, delay: Duration) {
        self.deadline = Instant::now().checked_add(delay);
        if self.deadline.is_none() {
            warn!(?delay, "Reschedule delay out of range, not rescheduling");
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes once when the armed deadline passes, then disarms.
    /// Never completes while disarmed.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => pending::<()>().await,
        }
    }
}
