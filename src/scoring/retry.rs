//! Retry policy for chunk submissions.
//!
//! The decision logic is a function from (attempt, error) to a decision,
//! separate from any I/O, so it is testable without a network. Backoff is
//! exponential with a cap, plus jitter so concurrent workers drift apart.
//!
//! [`RateGate`] is the collective throttle: one shared next-allowed-send
//! instant consulted by every scoring worker. When the service signals a
//! rate limit, the gate moves forward once for everyone instead of each
//! worker retrying on its own clock.

use rand::Rng;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::ApiConfig;
use crate::error::ScoringError;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Fail,
}

/// Exponential backoff policy with a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_ms: u64,
    max_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            base_ms,
            max_ms,
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            config.retry_backoff_base_ms,
            config.retry_backoff_max_ms,
        )
    }

    /// Decide the fate of a request whose `attempt`-th try (1-based) failed
    /// with `error`.
    pub fn decide(&self, attempt: u32, error: &ScoringError) -> RetryDecision {
        if !error.is_transient() || attempt >= self.max_attempts {
            return RetryDecision::Fail;
        }
        RetryDecision::RetryAfter(self.backoff(attempt))
    }

    /// Capped exponential delay before attempt `attempt + 1`, with jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter_ceiling = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
        base + Duration::from_millis(jitter)
    }

    /// Deterministic part of the delay: base * 2^(attempt-1), capped.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .base_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_ms);
        Duration::from_millis(ms)
    }
}

/// Shared send gate across all scoring workers.
#[derive(Debug)]
pub struct RateGate {
    not_before: Mutex<Instant>,
}

impl RateGate {
    pub fn new() -> Self {
        Self {
            not_before: Mutex::new(Instant::now()),
        }
    }

    /// Wait until sends are allowed again. Cheap when the gate is open.
    pub async fn acquire(&self) {
        let until = *self.not_before.lock().await;
        if until > Instant::now() {
            tokio::time::sleep_until(until).await;
        }
    }

    /// Close the gate for `duration` from now. Never moves the gate
    /// backwards, so concurrent rate-limit signals extend rather than
    /// shorten the pause.
    pub async fn hold_for(&self, duration: Duration) {
        let mut not_before = self.not_before.lock().await;
        let candidate = Instant::now() + duration;
        if candidate > *not_before {
            *not_before = candidate;
        }
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}
