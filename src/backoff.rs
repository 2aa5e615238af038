//! Exponential backoff schedule for upstream retries.
//!
//! Attempt semantics: attempt index `0` is the initial call (no delay); retries
//! start at `attempt = 1`, whose base delay is the configured initial delay.
//! Each further retry doubles it. The schedule is uncapped here; the retry
//! policy applies jitter first and then clamps to its maximum delay.
//!
//! ```rust
//! use std::time::Duration;
//! use tixgate::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(3000));
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(3000));
//! assert_eq!(backoff.delay(3), Duration::from_millis(12000));
//! ```

use std::time::Duration;

/// Ceiling used when the doubling would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Doubling backoff starting at `initial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
}

impl Backoff {
    /// Create an exponential schedule whose first retry waits `initial`.
    pub fn exponential(initial: Duration) -> Self {
        Self { initial }
    }

    /// Base delay of the first retry.
    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Un-jittered delay before `attempt`: `initial * 2^(attempt-1)`.
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.initial.as_nanos().saturating_mul(multiplier);
        Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
    }
}
