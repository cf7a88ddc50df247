//! Process-wide throttle for generation calls.
//!
//! A token bucket refilled continuously at `ceiling / window` (capacity
//! `burst`) smooths bursts, and a sliding log of admission instants caps the
//! count inside any window at `ceiling`. Waiters queue on a fair mutex, so
//! permits are granted in arrival order. A waiter that is dropped (timeout or
//! cancellation) never consumed anything, and granted permits expire on their
//! own schedule rather than being handed back.

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::pipeline_config::RateLimitConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateLimitError {
    #[error("Rate limiter wait exceeded {0:?}")]
    Timeout(Duration),
}

/// Proof of admission. Holds no resource; dropping it releases nothing.
#[derive(Debug, Clone, Copy)]
pub struct Permit {
    pub granted_at: Instant,
    pub waited: Duration,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterStatus {
    pub available_tokens: f64,
    pub admitted_in_window: usize,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    admitted: VecDeque<Instant>,
}

impl BucketState {
    fn refill(&mut self, now: Instant, per_sec: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_sec).min(capacity);
        self.last_refill = now;
    }

    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Tolerance for float drift in the refill arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
    ceiling: usize,
    window: Duration,
    capacity: f64,
    per_sec: f64,
    acquire_timeout: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let ceiling = config.ceiling.max(1);
        let window = config.window().max(Duration::from_millis(1));
        let capacity = f64::from(config.burst.clamp(1, ceiling));
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                admitted: VecDeque::with_capacity(ceiling as usize),
            }),
            ceiling: ceiling as usize,
            window,
            capacity,
            per_sec: f64::from(ceiling) / window.as_secs_f64(),
            acquire_timeout: config.acquire_timeout(),
        }
    }

    /// Wait for a permit, failing with [`RateLimitError::Timeout`] once the
    /// configured wait elapses.
    pub async fn acquire(&self) -> Result<Permit, RateLimitError> {
        let started = Instant::now();
        match tokio::time::timeout(self.acquire_timeout, self.acquire_unbounded(started)).await {
            Ok(permit) => Ok(permit),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.acquire_timeout.as_millis() as u64,
                    "Rate limiter acquire timed out"
                );
                Err(RateLimitError::Timeout(self.acquire_timeout))
            }
        }
    }

    async fn acquire_unbounded(&self, started: Instant) -> Permit {
        // Held across the sleeps below: the queue of waiters is the mutex queue.
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            state.refill(now, self.per_sec, self.capacity);
            state.evict(now, self.window);

            let wait = self.wait_needed(&state, now);
            if wait.is_zero() {
                state.tokens = (state.tokens - 1.0).max(0.0);
                state.admitted.push_back(now);
                let waited = now.saturating_duration_since(started);
                tracing::debug!(
                    waited_ms = waited.as_millis() as u64,
                    in_window = state.admitted.len(),
                    "Rate limiter permit granted"
                );
                return Permit {
                    granted_at: now,
                    waited,
                };
            }

            tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting");
            tokio::time::sleep(wait).await;
        }
    }

    fn wait_needed(&self, state: &BucketState, now: Instant) -> Duration {
        let bucket_wait = if state.tokens + TOKEN_EPSILON >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.per_sec)
        };

        let window_wait = if state.admitted.len() < self.ceiling {
            Duration::ZERO
        } else {
            state
                .admitted
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO)
        };

        let wait = bucket_wait.max(window_wait);
        // Round sub-millisecond remainders up so the next pass is admitted.
        if !wait.is_zero() && wait < Duration::from_millis(1) {
            Duration::from_millis(1)
        } else {
            wait
        }
    }

    /// Current counters. Waits for queued acquirers ahead of it.
    pub async fn status(&self) -> LimiterStatus {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.refill(now, self.per_sec, self.capacity);
        state.evict(now, self.window);
        LimiterStatus {
            available_tokens: state.tokens,
            admitted_in_window: state.admitted.len(),
        }
    }
}
