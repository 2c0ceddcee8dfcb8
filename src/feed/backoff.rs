//! Reconnection backoff: exponential growth, "equal jitter", hard ceiling.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

/// Exponents past this are clamped; `2^32 * 1ms` already exceeds any sane cap.
const MAX_EXPONENT: u32 = 32;

/// Pure `attempts → delay` mapping.
///
/// `exp = min(2^attempts * base, max)`, delay is `exp/2 + uniform(0, exp/2)`.
#[derive(Debug)]
pub struct BackoffCalculator {
    base: Duration,
    max: Duration,
    rng: StdRng,
}

impl BackoffCalculator {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self::with_rng(base, max, StdRng::from_entropy())
    }

    /// Deterministic calculator for tests.
    pub fn seeded(base: Duration, max: Duration, seed: u64) -> Self {
        Self::with_rng(base, max, StdRng::seed_from_u64(seed))
    }

    fn with_rng(base: Duration, max: Duration, rng: StdRng) -> Self {
        Self {
            base,
            max: max.max(base),
            rng,
        }
    }

    /// The un-jittered exponential value, always within `[base, max]`.
    pub fn ceiling(&self, attempts: u32) -> Duration {
        let factor = 1u128 << attempts.min(MAX_EXPONENT);
        let exp_ns = self
            .base
            .as_nanos()
            .saturating_mul(factor)
            .min(self.max.as_nanos())
            .min(u128::from(u64::MAX));
        Duration::from_nanos(exp_ns as u64)
    }

    pub fn next_delay(&mut self, attempts: u32) -> Duration {
        // `ceiling` is clamped to u64 nanoseconds.
        let exp_ns = self.ceiling(attempts).as_nanos() as u64;
        let half = exp_ns / 2;
        let jitter = self.rng.gen_range(0..=half);
        Duration::from_nanos(half + jitter)
    }
}

/// Mutable retry bookkeeping owned by the engine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    pub attempts: u32,
    pub last_attempt_at: Option<Instant>,
}

impl BackoffState {
    pub fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// One delivered data frame forgives one failed attempt.
    pub fn recover(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(3600);

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let calc = BackoffCalculator::seeded(BASE, MAX, 7);
        assert_eq!(calc.ceiling(0), Duration::from_secs(1));
        assert_eq!(calc.ceiling(1), Duration::from_secs(2));
        assert_eq!(calc.ceiling(5), Duration::from_secs(32));
        assert_eq!(calc.ceiling(11), Duration::from_secs(2048));
        assert_eq!(calc.ceiling(12), MAX);
        assert_eq!(calc.ceiling(u32::MAX), MAX);
    }

    #[test]
    fn test_delay_within_half_open_band() {
        let mut calc = BackoffCalculator::seeded(BASE, MAX, 42);
        for attempts in 0..=20 {
            let ceiling = calc.ceiling(attempts);
            for _ in 0..50 {
                let delay = calc.next_delay(attempts);
                assert!(delay >= ceiling / 2, "attempt {attempts}: {delay:?} < half");
                assert!(delay <= ceiling, "attempt {attempts}: {delay:?} > ceiling");
                assert!(delay <= MAX);
            }
        }
    }

    #[test]
    fn test_mean_non_decreasing_until_cap() {
        let mut calc = BackoffCalculator::seeded(BASE, MAX, 1234);
        let mut previous = Duration::ZERO;
        // 2^11 s is the last uncapped step for a 1 h ceiling.
        for attempts in 0..=11 {
            let total: Duration = (0..200).map(|_| calc.next_delay(attempts)).sum();
            let mean = total / 200;
            assert!(mean >= previous, "mean dropped at attempt {attempts}");
            previous = mean;
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = BackoffCalculator::seeded(BASE, MAX, 99);
        let mut b = BackoffCalculator::seeded(BASE, MAX, 99);
        for attempts in 0..10 {
            assert_eq!(a.next_delay(attempts), b.next_delay(attempts));
        }
    }

    #[test]
    fn test_max_below_base_is_raised() {
        let calc = BackoffCalculator::seeded(Duration::from_secs(5), Duration::from_secs(1), 0);
        assert_eq!(calc.ceiling(3), Duration::from_secs(5));
    }

    #[test]
    fn test_sub_millisecond_base_keeps_floor() {
        let base = Duration::from_micros(250);
        let mut calc = BackoffCalculator::seeded(base, MAX, 3);
        assert_eq!(calc.ceiling(0), base);
        assert_eq!(calc.ceiling(2), Duration::from_micros(1000));
        for _ in 0..50 {
            let delay = calc.next_delay(0);
            assert!(delay >= base / 2 && delay <= base, "{delay:?}");
        }
    }

    #[test]
    fn test_state_recover_saturates() {
        let mut state = BackoffState::default();
        state.recover();
        assert_eq!(state.attempts, 0);
        state.record_failure();
        state.record_failure();
        state.recover();
        assert_eq!(state.attempts, 1);
        state.reset();
        assert_eq!(state.attempts, 0);
    }
}
