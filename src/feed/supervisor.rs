//! Consecutive-failure circuit breaker.
//!
//! Counts failures since the last successful handshake. Once the count
//! reaches the threshold the engine stops trusting its accumulated state and
//! performs a hard reset instead of another backoff retry.

use crate::config::DEFAULT_MAX_CONSECUTIVE_FAILURES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardResetSupervisor {
    consecutive_failures: u32,
    threshold: u32,
}

impl Default for HardResetSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONSECUTIVE_FAILURES)
    }
}

impl HardResetSupervisor {
    /// A threshold of zero is treated as one.
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    /// A completed handshake clears the streak.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn should_hard_reset(&self) -> bool {
        self.consecutive_failures >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}
