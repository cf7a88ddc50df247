//! Exponential backoff with cap and optional jitter.

use std::time::Duration;

use rand::Rng;

/// Delay schedule for retried calls.
///
/// Attempt `n` (0-based) waits `initial * multiplier^n`, capped at `max`,
/// plus a uniformly random jitter in `[0, jitter]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
            multiplier: 2,
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        let base = self.initial.saturating_mul(factor).min(self.max);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }
}
