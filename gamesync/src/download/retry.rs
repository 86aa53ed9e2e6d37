//! Backoff policy shared by transfers and part retries.
//!
//! The attempt bound lives with the caller (transfers stop after
//! `max_attempts`, part retries may run unbounded); this type only answers
//! "how long to wait before attempt N".

use std::time::Duration;

use rand::Rng;

use super::cancel::CancelToken;
use super::error::{DownloadError, DownloadResult};

/// Default initial delay for exponential backoff (1 second).
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;

/// Default maximum delay for exponential backoff (12 seconds).
pub const DEFAULT_MAX_DELAY_SECS: u64 = 12;

/// Default multiplier for exponential backoff.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default upper bound for random jitter added to each delay.
pub const DEFAULT_JITTER_MS: u64 = 250;

/// Exponential backoff with a cap and optional jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure.
    pub multiplier: f64,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Creates an exponential backoff policy with the default parameters.
    ///
    /// Uses:
    /// - Initial delay: 1s ([`DEFAULT_INITIAL_DELAY_MS`])
    /// - Max delay: 12s ([`DEFAULT_MAX_DELAY_SECS`])
    /// - Multiplier: 2.0 ([`DEFAULT_BACKOFF_MULTIPLIER`])
    /// - Jitter: up to 250ms ([`DEFAULT_JITTER_MS`])
    pub fn exponential() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: Duration::from_millis(DEFAULT_JITTER_MS),
        }
    }

    /// Creates a constant-delay policy without jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: Duration::ZERO,
        }
    }

    /// Set the jitter bound.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculates the capped delay for a failed attempt, without jitter.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt that just failed (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Calculates the delay for a failed attempt, including jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    /// Sleep before the next attempt, waking early on cancellation.
    pub async fn wait(&self, attempt: u32, token: &CancelToken) -> DownloadResult<()> {
        let delay = self.delay_for_attempt(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = token.cancelled() => Err(DownloadError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.initial_delay,
            Duration::from_millis(DEFAULT_INITIAL_DELAY_MS)
        );
        assert_eq!(policy.max_delay, Duration::from_secs(DEFAULT_MAX_DELAY_SECS));
        assert_eq!(policy.multiplier, DEFAULT_BACKOFF_MULTIPLIER);
    }

    #[test]
    fn test_retry_policy_fixed() {
        let policy = RetryPolicy::fixed(Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(100));
    }

    #[test]
    fn test_retry_policy_exponential() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: Duration::ZERO,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_policy_respects_max_delay() {
        let policy = RetryPolicy::exponential().with_jitter(Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(12));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(12));
    }

    #[tokio::test]
    async fn test_wait_returns_cancelled() {
        let policy = RetryPolicy::fixed(Duration::from_secs(60));
        let token = CancelToken::new();
        token.cancel();

        let result = policy.wait(1, &token).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    proptest! {
        #[test]
        fn prop_delay_within_cap_plus_jitter(attempt in 1u32..1000, jitter_ms in 0u64..500) {
            let policy = RetryPolicy::exponential().with_jitter(Duration::from_millis(jitter_ms));
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay >= policy.base_delay(attempt));
            prop_assert!(delay <= policy.max_delay + Duration::from_millis(jitter_ms));
        }

        #[test]
        fn prop_base_delay_is_monotonic(attempt in 1u32..200) {
            let policy = RetryPolicy::exponential();
            prop_assert!(policy.base_delay(attempt) <= policy.base_delay(attempt + 1));
        }
    }
}
