//! Bounded exponential backoff for broker connection attempts

use std::time::Duration;

/// Retry budget for establishing a consuming session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before giving up
    pub max_retries: u32,
    /// Wait after the first failed attempt; doubles with each further failure
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    /// Wait after failed attempt `attempt` (1-based), or `None` once the
    /// budget is spent and no further attempt should be made
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_retries {
            return None;
        }
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        Some(self.initial_delay.saturating_mul(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double() {
        let policy = RetryPolicy::new(5, Duration::from_secs(5));

        let delays: Vec<_> = (1..=5).map(|k| policy.delay_after(k)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(5)),
                Some(Duration::from_secs(10)),
                Some(Duration::from_secs(20)),
                Some(Duration::from_secs(40)),
                None,
            ]
        );
    }

    #[test]
    fn test_single_attempt_never_waits() {
        let policy = RetryPolicy::new(1, Duration::from_secs(5));
        assert_eq!(policy.delay_after(1), None);
    }

    #[test]
    fn test_large_attempts_saturate() {
        let policy = RetryPolicy::new(u32::MAX, Duration::MAX / 2);
        assert_eq!(policy.delay_after(3), Some(Duration::MAX));
        assert!(policy.delay_after(64).is_some());
    }
}
