use std::time::Duration;

/// Doubling backoff between re-applications of a conflicted write, also used
/// between realtime rejoins.
///
/// Delay `n` is `first * 2^n`, clamped to `ceiling`. A server-provided
/// retry-after hint raises the delay but is clamped the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    first: Duration,
    ceiling: Duration,
}

impl RetryPolicy {
    /// A `ceiling` shorter than `first` is raised to `first`.
    pub fn new(first: Duration, ceiling: Duration) -> Self {
        Self {
            first,
            ceiling: ceiling.max(first),
        }
    }

    pub fn first(&self) -> Duration {
        self.first
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Wait before zero-based retry `attempt`.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let scheduled = 2_u32
            .checked_pow(attempt)
            .and_then(|factor| self.first.checked_mul(factor))
            .unwrap_or(self.ceiling);
        scheduled.max(hint.unwrap_or_default()).min(self.ceiling)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn doubles_from_first_delay_up_to_ceiling() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (0..7).map(|attempt| policy.delay(attempt, None)).collect();
        assert_eq!(
            delays,
            vec![ms(200), ms(400), ms(800), ms(1_600), ms(3_200), ms(5_000), ms(5_000)]
        );
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_ceiling() {
        let policy = RetryPolicy::new(ms(1), ms(30_000));
        assert_eq!(policy.delay(40, None), ms(30_000));
        assert_eq!(policy.delay(u32::MAX, None), ms(30_000));
    }

    #[test]
    fn server_hint_lengthens_but_never_exceeds_ceiling() {
        let policy = RetryPolicy::new(ms(100), ms(2_000));
        assert_eq!(policy.delay(0, Some(ms(1_500))), ms(1_500));
        assert_eq!(policy.delay(3, Some(ms(10))), ms(800));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(60))), ms(2_000));
    }

    #[test]
    fn ceiling_is_raised_to_first_delay() {
        let policy = RetryPolicy::new(ms(500), ms(10));
        assert_eq!(policy.ceiling(), ms(500));
        assert_eq!(policy.delay(4, None), ms(500));
    }
}
