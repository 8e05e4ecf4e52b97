//! Reconnect backoff schedule.

use std::time::Duration;

/// Exponential backoff with a cap and a bounded number of attempts.
///
/// The delay before attempt `n` (1-based) is `min(base * 2^n, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Base delay.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Attempts made before giving up.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt`, or `None` once the attempts
    /// are exhausted.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.cap))
    }
}
