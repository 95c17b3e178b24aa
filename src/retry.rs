//! Retry backoff policy
//!
//! Exponential backoff with full jitter, shared by the debrid gateway
//! (5xx/429 retries) and the job manager (transient download failures).

use std::time::Duration;

/// Exponential backoff with full jitter.
///
/// The delay for attempt `n` is drawn uniformly from
/// `[0, min(base * factor^n, cap)]`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for the first attempt
    pub base: Duration,
    /// Multiplier applied per attempt
    pub factor: u32,
    /// Upper bound on the un-jittered delay
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            factor: 2,
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered ceiling for a given attempt (0-indexed).
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let factor = (self.factor as u64).saturating_pow(attempt.min(10));
        let delay = self
            .base
            .as_millis()
            .saturating_mul(factor as u128)
            .min(self.cap.as_millis());
        Duration::from_millis(delay as u64)
    }

    /// Delay for a given attempt with full jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::Rng::gen_range(&mut rand::thread_rng(), 0..=ceiling))
    }

    /// Sleep out the backoff for `attempt`, returning early on cancellation.
    ///
    /// Returns `false` if cancelled.
    pub async fn wait(&self, attempt: u32, cancel: &tokio_util::sync::CancellationToken) -> bool {
        let delay = self.delay_for_attempt(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.ceiling_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.ceiling_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.ceiling_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.ceiling_for_attempt(4), Duration::from_secs(32));
        // 2 * 2^5 = 64s > cap
        assert_eq!(policy.ceiling_for_attempt(5), Duration::from_secs(60));
        assert_eq!(policy.ceiling_for_attempt(30), Duration::from_secs(60));
    }

    #[test]
    fn jittered_delay_stays_under_ceiling() {
        let policy = BackoffPolicy::default();
        for attempt in 0..8 {
            let ceiling = policy.ceiling_for_attempt(attempt);
            for _ in 0..50 {
                assert!(policy.delay_for_attempt(attempt) <= ceiling);
            }
        }
    }

    #[tokio::test]
    async fn wait_returns_false_on_cancel() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(30),
            ..Default::default()
        };
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        assert!(!policy.wait(3, &cancel).await);
    }
}
