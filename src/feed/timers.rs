//! Named watchdog timers.
//!
//! Each timer is a one-shot deadline keyed by name. The engine awaits the
//! earliest deadline alongside socket and command input and dispatches every
//! expired timer into its state machine, so firing is just another event.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// The timers the engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timer {
    /// Transport open + `connection_ack` must finish before this fires.
    ConnectTimeout,
    /// No data frame within the idle timeout while subscribed.
    Heartbeat,
    /// The single scheduled connection attempt (the delay worker).
    Reconnect,
    /// Subscription has been healthy long enough to forgive backoff.
    Stable,
}

impl Timer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timer::ConnectTimeout => "connect-timeout",
            Timer::Heartbeat => "heartbeat",
            Timer::Reconnect => "reconnect",
            Timer::Stable => "stable",
        }
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry of armed timers.
#[derive(Debug, Default)]
pub struct Watchdogs {
    deadlines: HashMap<Timer, Instant>,
}

impl Watchdogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `timer` to fire after `delay`, replacing any pending deadline.
    pub fn arm(&mut self, timer: Timer, delay: Duration) -> Instant {
        let deadline = Instant::now() + delay;
        if self.deadlines.insert(timer, deadline).is_some() {
            tracing::trace!("Re-armed {} timer ({:?})", timer, delay);
        }
        deadline
    }

    /// Disarm without firing. Returns whether the timer was armed.
    pub fn cancel(&mut self, timer: Timer) -> bool {
        self.deadlines.remove(&timer).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_armed(&self, timer: Timer) -> bool {
        self.deadlines.contains_key(&timer)
    }

    pub fn deadline(&self, timer: Timer) -> Option<Instant> {
        self.deadlines.get(&timer).copied()
    }

    pub fn armed_count(&self) -> usize {
        self.deadlines.len()
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        let mut expired: Vec<(Instant, Timer)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(timer, deadline)| (*deadline, *timer))
            .collect();
        expired.sort();

        for (_, timer) in &expired {
            self.deadlines.remove(timer);
        }
        expired.into_iter().map(|(_, timer)| timer).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_arm_replaces_existing_deadline() {
        let mut timers = Watchdogs::new();
        timers.arm(Timer::Reconnect, Duration::from_secs(10));
        timers.arm(Timer::Reconnect, Duration::from_secs(2));
        assert_eq!(timers.armed_count(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(timers.take_expired(Instant::now()), vec![Timer::Reconnect]);
        assert!(!timers.is_armed(Timer::Reconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let mut timers = Watchdogs::new();
        timers.arm(Timer::Heartbeat, Duration::from_secs(1));
        assert!(timers.cancel(Timer::Heartbeat));
        assert!(!timers.cancel(Timer::Heartbeat));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(timers.take_expired(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_in_deadline_order() {
        let mut timers = Watchdogs::new();
        timers.arm(Timer::Heartbeat, Duration::from_secs(3));
        timers.arm(Timer::ConnectTimeout, Duration::from_secs(1));
        timers.arm(Timer::Stable, Duration::from_secs(60));

        assert_eq!(
            timers.next_deadline(),
            timers.deadline(Timer::ConnectTimeout)
        );

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            timers.take_expired(Instant::now()),
            vec![Timer::ConnectTimeout, Timer::Heartbeat]
        );
        assert_eq!(timers.armed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let mut timers = Watchdogs::new();
        timers.arm(Timer::Heartbeat, Duration::from_secs(3));
        timers.arm(Timer::Reconnect, Duration::from_secs(1));
        timers.cancel_all();
        assert_eq!(timers.armed_count(), 0);
        assert_eq!(timers.next_deadline(), None);
    }
}
