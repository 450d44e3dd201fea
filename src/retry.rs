use std::time::Duration;

/// Exponential backoff with a cap and uniform jitter.
///
/// The shape is the contract: monotonically non-decreasing with attempt
/// count and bounded above. The concrete numbers are configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on the computed delay, jitter excluded.
    pub cap: Duration,

    /// Uniform jitter in `0..=jitter`, added after capping.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(60_000),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-indexed), without jitter.
    ///
    /// `min(base * 2^(attempt - 1), cap)`, saturating on overflow.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let pow = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = base_ms.saturating_mul(pow).min(cap_ms.max(base_ms));
        Duration::from_millis(ms)
    }

    /// `delay` plus jitter, for scheduling the actual `next_retry_at`.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };
        self.delay(attempt) + jitter
    }

    /// Absolute due time for retry number `attempt`, in Unix millis.
    pub fn next_retry_at(&self, now_ms: u64, attempt: u32) -> u64 {
        now_ms.saturating_add(self.delay_with_jitter(attempt).as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay(7), Duration::from_millis(60_000));
        assert_eq!(policy.delay(100), Duration::from_millis(60_000));
    }

    #[test]
    fn delays_are_monotone() {
        let policy = RetryPolicy::default();
        let mut prev = Duration::ZERO;
        for attempt in 1..=40 {
            let d = policy.delay(attempt);
            assert!(d >= prev, "delay regressed at attempt {attempt}");
            prev = d;
        }
    }

    #[test]
    fn jitter_stays_within_its_bound() {
        let policy = RetryPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
        };
        for _ in 0..100 {
            let d = policy.delay_with_jitter(1);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn zero_attempt_uses_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(1_000));
    }

    #[test]
    fn next_retry_at_is_absolute() {
        let policy = RetryPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(100),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.next_retry_at(5_000, 1), 5_100);
    }
}
