//! Timing helpers for collaborator retries and execution records.

use std::time::{Duration, Instant};

/// Exponential backoff: `base * 2^attempt`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Milliseconds elapsed since `start`, clamped to `u64`.
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_saturates_on_large_attempts() {
        let delay = backoff_delay(Duration::from_secs(1), 64);
        assert_eq!(delay, Duration::from_secs(1).saturating_mul(u32::MAX));
    }

    #[test]
    fn elapsed_is_monotone() {
        let start = Instant::now();
        let first = elapsed_ms(start);
        assert!(elapsed_ms(start) >= first);
    }
}
