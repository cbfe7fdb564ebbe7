//! Leaky-bucket throttle for apply passes.
//!
//! Programming the kernel has a high fixed cost per call, so the driver
//! bounds how often it runs an apply pass. One token is added per refill
//! tick, up to the bucket size; each pass spends one.

use tracing::info;

#[derive(Debug)]
pub struct Throttle {
    bucket_size: u32,
    tokens: u32,
    /// Whether the last admission attempt was refused. Only used for logging.
    throttled: bool,
}

impl Throttle {
    /// Create an empty bucket. Call [`Throttle::refill`] to allow the first
    /// pass immediately.
    pub fn new(bucket_size: u32) -> Self {
        Self {
            bucket_size: bucket_size.max(1),
            tokens: 0,
            throttled: false,
        }
    }

    /// Add one token, up to the bucket size.
    pub fn refill(&mut self) {
        if self.tokens < self.bucket_size {
            self.tokens += 1;
        }
    }

    /// Spend a token if one is available.
    pub fn admit(&mut self) -> bool {
        if self.tokens == 0 {
            if !self.throttled {
                info!("Dataplane updates throttled");
                self.throttled = true;
            }
            return false;
        }
        self.tokens -= 1;
        if self.throttled && self.would_admit() {
            info!("Dataplane updates no longer throttled");
            self.throttled = false;
        }
        true
    }

    /// Whether the next [`Throttle::admit`] would succeed.
    pub fn would_admit(&self) -> bool {
        self.tokens > 0
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }
}
