//! Rate-limit cooldown.
//!
//! A "too many requests" signal suppresses every connection attempt until the
//! cooldown deadline passes. This is independent of exponential backoff: the
//! guard never touches attempt counters.
//!
//! The guard is a cheap handle around shared state. Each engine gets its own
//! by default; engines that share one upstream credential can be handed
//! clones of the same guard so a cooldown seen by one applies to all.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::DEFAULT_RATE_LIMIT_COOLDOWN;

#[derive(Debug, Clone)]
pub struct RateLimitGuard {
    cooldown: Duration,
    until: Arc<Mutex<Option<Instant>>>,
}

impl Default for RateLimitGuard {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_COOLDOWN)
    }
}

impl RateLimitGuard {
    /// `cooldown` is the window used when the signal carries no hint; it is
    /// jittered by ±10%.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            until: Arc::new(Mutex::new(None)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        // The guarded value is a plain `Option<Instant>`; a poisoned lock
        // still holds a usable deadline.
        self.until.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start (or extend) a cooldown and return its deadline.
    ///
    /// A later deadline always wins over an earlier one.
    pub fn note_rate_limited(&self, retry_after: Option<Duration>) -> Instant {
        let window = retry_after.unwrap_or_else(|| self.jittered_default());
        let candidate = Instant::now() + window;

        let mut until = self.lock();
        let deadline = match *until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        };
        *until = Some(deadline);
        deadline
    }

    pub fn can_attempt(&self) -> bool {
        self.remaining_cooldown().is_zero()
    }

    /// Time left until attempts are allowed again; zero when not cooling down.
    pub fn remaining_cooldown(&self) -> Duration {
        let until = *self.lock();
        until
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        let until = *self.lock();
        until.filter(|deadline| *deadline > Instant::now())
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    fn jittered_default(&self) -> Duration {
        let spread_ms = (self.cooldown.as_millis() / 10) as i64;
        if spread_ms == 0 {
            return self.cooldown;
        }
        let offset = rand::thread_rng().gen_range(-spread_ms..=spread_ms);
        let total = self.cooldown.as_millis() as i64 + offset;
        Duration::from_millis(total.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fresh_guard_allows_attempts() {
        let guard = RateLimitGuard::default();
        assert!(guard.can_attempt());
        assert_eq!(guard.remaining_cooldown(), Duration::ZERO);
        assert_eq!(guard.cooldown_until(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hint_sets_exact_window() {
        let guard = RateLimitGuard::default();
        guard.note_rate_limited(Some(Duration::from_secs(30)));
        assert!(!guard.can_attempt());
        assert_eq!(guard.remaining_cooldown(), Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!guard.can_attempt());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(guard.can_attempt());
        assert_eq!(guard.remaining_cooldown(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_window_is_jittered_around_ten_minutes() {
        let guard = RateLimitGuard::default();
        guard.note_rate_limited(None);
        let remaining = guard.remaining_cooldown();
        assert!(remaining >= Duration::from_secs(540), "{remaining:?}");
        assert!(remaining <= Duration::from_secs(660), "{remaining:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_signal_does_not_shrink_cooldown() {
        let guard = RateLimitGuard::default();
        let first = guard.note_rate_limited(Some(Duration::from_secs(120)));
        let second = guard.note_rate_limited(Some(Duration::from_secs(5)));
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_cooldown() {
        let a = RateLimitGuard::default();
        let b = a.clone();
        a.note_rate_limited(Some(Duration::from_secs(60)));
        assert!(!b.can_attempt());
        b.clear();
        assert!(a.can_attempt());
    }
}
