use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;

/// Acquisition retry policy: exponential backoff with optional additive
/// jitter, shared by every backend's acquire loop.
///
/// Attempts are indexed from 0. Attempt 0 is the first try with no pre-sleep;
/// attempt `k` (k ≥ 1) sleeps [`backoff(k)`](Self::backoff) before issuing
/// the call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of acquisition attempts (≥ 1).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each attempt after that.
    pub initial_delay: Duration,
    /// Upper bound on the computed delay, before jitter.
    pub max_delay: Duration,
    /// When `true`, a uniform random extra in `[0, delay * jitter_factor]`
    /// is added so concurrent contenders spread out.
    pub jitter: bool,
    /// Jitter proportion in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: true,
            jitter_factor: 0.5,
        }
    }
}

impl RetryConfig {
    /// Validate configuration values.
    ///
    /// Returns `Err` with a description if any value is invalid:
    /// - `max_attempts` must be >= 1
    /// - `initial_delay` must be > 0
    /// - `max_delay` must be >= `initial_delay`
    /// - `jitter_factor` must be within [0, 1]
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("max_attempts must be >= 1".into());
        }
        if self.initial_delay.is_zero() {
            return Err("initial_delay must be > 0".into());
        }
        if self.max_delay < self.initial_delay {
            return Err("max_delay must be >= initial_delay".into());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitter_factor must be within [0, 1]".into());
        }
        Ok(())
    }

    /// Compute the delay preceding `attempt`.
    ///
    /// Attempt 0 gets no delay. Attempt k ≥ 1 gets
    /// `min(max_delay, initial_delay * 2^(k-1))`, with the jitter extra added
    /// after clamping, so a jittered delay lies in
    /// `[delay, delay * (1 + jitter_factor)]`. Randomness is not
    /// cryptographic.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let doubling = 2u32.saturating_pow(attempt - 1);
        let delay = self.initial_delay.saturating_mul(doubling).min(self.max_delay);

        let factor = self.jitter_factor.clamp(0.0, 1.0);
        if self.jitter && factor > 0.0 {
            let extra = delay.mul_f64(rand::thread_rng().gen_range(0.0..=factor));
            delay.saturating_add(extra)
        } else {
            delay
        }
    }

    /// Sleep the backoff for `attempt`, racing against `cancel`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Cancelled`] if the token fires before the sleep
    /// completes.
    pub async fn sleep(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), LockError> {
        let delay = self.backoff(attempt);
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            () = cancel.cancelled() => Err(LockError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
