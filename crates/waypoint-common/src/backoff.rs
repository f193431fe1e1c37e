//! Capped exponential backoff with jitter
//!
//! Used by the heartbeat, the watcher and the resolver for every local
//! retry loop.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// `delay(attempt)` with jitter drawn uniformly from `[delay/2, delay]`.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let millis = self.delay(attempt).as_millis() as u64;
        if millis < 2 {
            return Duration::from_millis(millis);
        }
        Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5))
    }
}
