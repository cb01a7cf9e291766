use std::time::Duration;

/// Exponential backoff policy for realtime resubscribe loops.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms: base_delay_ms.max(1),
            max_delay_ms: max_delay_ms.max(1),
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// A backend-provided retry-after hint always wins when it is larger
    /// than the computed backoff; the result never exceeds the policy max.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let doubled = self
            .base_delay_ms
            .saturating_mul(1_u64 << attempt.min(20));
        let hinted = doubled.max(retry_after_hint_ms.unwrap_or(0));
        Duration::from_millis(hinted.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(250, 15_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_base_delay() {
        let policy = RetryPolicy::new(250, 8_000);
        assert_eq!(
            policy.delay_for_attempt(0, None),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn doubles_per_attempt_up_to_max() {
        let policy = RetryPolicy::new(100, 10_000);
        assert_eq!(
            policy.delay_for_attempt(3, None),
            Duration::from_millis(800)
        );
        assert_eq!(
            policy.delay_for_attempt(30, None),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn honors_retry_after_hint_when_larger() {
        let policy = RetryPolicy::new(250, 20_000);
        assert_eq!(
            policy.delay_for_attempt(0, Some(5_000)),
            Duration::from_millis(5_000)
        );
    }

    #[test]
    fn hint_is_still_capped_by_max() {
        let policy = RetryPolicy::new(250, 2_000);
        assert_eq!(
            policy.delay_for_attempt(0, Some(60_000)),
            Duration::from_millis(2_000)
        );
    }
}
