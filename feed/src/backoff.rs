//! Reconnect backoff policy.
//!
//! Delays grow exponentially from `base` and are capped at `max_delay`. Each
//! delay is drawn with full jitter:
//!
//! ```text
//! delay = random(0 ..= min(max_delay, base * 2^attempt))
//! ```

use std::time::Duration;

use rand::Rng;

/// Default base delay (500ms).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default maximum delay (30 seconds).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// How the feed connection retries after an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay ceiling for the first retry.
    pub base: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Maximum consecutive failed attempts, or `None` to retry forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Creates a policy that retries forever.
    #[must_use]
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            max_delay,
            max_attempts: None,
        }
    }

    /// Limits the number of consecutive failed attempts (builder pattern).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// A policy with millisecond delays for tests.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_millis(10))
    }

    /// Returns `true` if `failed_attempts` has used up the budget.
    #[must_use]
    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        self.max_attempts
            .is_some_and(|max| failed_attempts >= max)
    }

    /// Upper bound of the jitter window for the given zero-indexed retry.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(exponential_ms.min(max_ms))
    }

    /// Picks the delay before the given zero-indexed retry.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.ceiling(attempt).as_millis() as u64;
        let jittered_ms = rand::rng().random_range(0..=ceiling_ms);
        Duration::from_millis(jittered_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}
