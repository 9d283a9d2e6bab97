//! # Reconnection Policy
//!
//! Bounded, jittered exponential backoff applied per call session when the
//! speech-service socket drops abnormally, fails to connect, or reports an
//! expired session.
//!
//! ## Delay formula:
//! `min(base * 2^attempt, cap)` plus ±20% uniform jitter. The attempt counter
//! increments on every failure and resets to zero on any successful
//! (re)connection. Once `max_attempts` failures accumulate the session is
//! abandoned — a fatal, non-retryable outcome for that call.

use rand::Rng;
use std::time::Duration;

/// Jitter applied around the exponential delay (fraction of the delay).
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Ceiling on the exponential delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Failures tolerated before the session is abandoned.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// The deterministic delay for a given attempt, before jitter.
    ///
    /// `attempt` is zero-based: attempt 0 waits `base`, attempt 1 waits
    /// `base * 2`, capped at `max_delay_ms`.
    pub fn raw_delay_ms(&self, attempt: u32) -> u64 {
        let shifted = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        shifted.min(self.max_delay_ms)
    }

    /// The jittered delay actually slept before a retry.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay_ms(attempt) as f64;
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let delayed = (raw * (1.0 + jitter)).max(0.0);
        Duration::from_millis(delayed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_delay_doubles_up_to_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.raw_delay_ms(0), 1_000);
        assert_eq!(policy.raw_delay_ms(1), 2_000);
        assert_eq!(policy.raw_delay_ms(2), 4_000);
        assert_eq!(policy.raw_delay_ms(3), 8_000);
        assert_eq!(policy.raw_delay_ms(4), 16_000);
        assert_eq!(policy.raw_delay_ms(5), 30_000);
        assert_eq!(policy.raw_delay_ms(20), 30_000);
        // Shift overflow saturates at the cap rather than wrapping.
        assert_eq!(policy.raw_delay_ms(200), 30_000);
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..6 {
            let raw = policy.raw_delay_ms(attempt) as f64;
            for _ in 0..100 {
                let d = policy.next_delay(attempt).as_millis() as f64;
                assert!(d >= raw * 0.8 - 1.0, "delay {d} below jitter floor for {raw}");
                assert!(d <= raw * 1.2 + 1.0, "delay {d} above jitter ceiling for {raw}");
            }
        }
    }

    #[test]
    fn test_first_two_delays_bracket_scenario() {
        // Abnormal close: first retry ≈1000ms, second ≈2000ms, each ±20%.
        let policy = ReconnectPolicy::default();
        let first = policy.next_delay(0).as_millis() as u64;
        let second = policy.next_delay(1).as_millis() as u64;
        assert!((800..=1200).contains(&first));
        assert!((1600..=2400).contains(&second));
    }

    #[test]
    fn test_raw_delays_are_monotonic() {
        let policy = ReconnectPolicy::default();
        let mut prev = 0;
        for attempt in 0..12 {
            let d = policy.raw_delay_ms(attempt);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[test]
    fn test_retry_budget() {
        let policy = ReconnectPolicy::default();
        for attempts in 0..5 {
            assert!(policy.should_retry(attempts));
        }
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }
}
