use std::fmt;
use std::time::Duration;

/// Delays shorter than this are spent yielding instead of sleeping.
const SLEEP_THRESHOLD: Duration = Duration::from_micros(10);

/// Pluggable delay between failed transaction attempts.
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    /// Delay for the given attempt (1-indexed). Must not have side effects.
    fn delay(&self, attempt: usize) -> Duration;

    /// Block the calling thread for [`delay`](Self::delay).
    fn backoff(&self, attempt: usize) {
        let delay = self.delay(attempt);
        if delay.is_zero() {
            return;
        }
        if delay < SLEEP_THRESHOLD {
            std::thread::yield_now();
        } else {
            std::thread::sleep(delay);
        }
    }
}

/// Doubling delay, starting at `min_delay` and capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoffPolicy {
    min_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffPolicy {
    pub const fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_nanos(100), Duration::from_millis(100))
    }
}

impl BackoffPolicy for ExponentialBackoffPolicy {
    fn delay(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(63) as u32;
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let nanos = (self.min_delay.as_nanos() as u64).saturating_mul(factor);
        Duration::from_nanos(nanos).min(self.max_delay)
    }
}

/// Restart immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn delay(&self, _attempt: usize) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_then_caps() {
        let policy = ExponentialBackoffPolicy::new(Duration::from_micros(1), Duration::from_micros(10));
        assert_eq!(policy.delay(1), Duration::from_micros(1));
        assert_eq!(policy.delay(2), Duration::from_micros(2));
        assert_eq!(policy.delay(4), Duration::from_micros(8));
        assert_eq!(policy.delay(5), Duration::from_micros(10));
        assert_eq!(policy.delay(10_000), Duration::from_micros(10));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let policy = ExponentialBackoffPolicy::default();
        assert_eq!(policy.delay(0), policy.delay(1));
    }

    #[test]
    fn no_backoff_never_waits() {
        assert_eq!(NoBackoff.delay(1_000), Duration::ZERO);
    }
}
