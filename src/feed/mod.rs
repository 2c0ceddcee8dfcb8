//! Live measurement feed: one persistent `graphql-transport-ws` subscription
//! kept alive with backoff, rate-limit cooldown and a hard-reset breaker.
//!
//! [`FeedClient`] is the handle; the connection itself lives in a background
//! tokio task (see [`native`]).

pub mod backoff;
pub mod codec;
pub mod native;
pub mod rate_limit;
pub mod supervisor;
pub mod timers;
pub mod transport;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;

pub use backoff::{BackoffCalculator, BackoffState};
pub use native::FeedClient;
pub use rate_limit::RateLimitGuard;
pub use supervisor::HardResetSupervisor;
pub use timers::{Timer, Watchdogs};
pub use transport::{Connector, Transport, TungsteniteConnector};

/// Connection lifecycle.
///
/// `Idle → Connecting → Authenticating → Subscribed → Closing → Closed`.
/// Failures drop back to `Idle` while a retry is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    /// Entitlement check, endpoint lookup and transport open in flight.
    Connecting,
    /// `connection_init` sent, waiting for `connection_ack`.
    Authenticating,
    Subscribed,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether an attempt is in flight or a subscription is live.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Subscribed
        )
    }
}

/// Everything the engine reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A connection attempt is starting.
    Connecting,
    /// Transport open, `connection_init` sent.
    Connected,
    /// Handshake acknowledged, subscription started.
    ConnectionAck,
    /// One `liveMeasurement` payload, passed through verbatim.
    Data(Value),
    Disconnected { code: Option<u16>, reason: String },
    /// Graceful client-side shutdown of a live subscription.
    Disconnecting,
    Error(String),
    Warn(String),
    Log(String),
    /// No data within the idle timeout.
    HeartbeatTimeout,
    /// The reconnect that follows a heartbeat timeout is starting.
    HeartbeatReconnect,
    RateLimited { until: DateTime<Utc> },
    /// Transport open + handshake exceeded the connect timeout.
    ConnectionTimeout,
}

/// Point-in-time view of the engine, published after every transition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedStatus {
    pub state: ConnectionState,
    pub active: bool,
    pub unauthenticated: bool,
    /// Backoff attempts.
    pub attempts: u32,
    pub consecutive_failures: u32,
    /// Id of the current (or last) subscription; 0 before the first one.
    pub operation_id: u64,
    pub cooldown_until: Option<Instant>,
    pub armed_timers: Vec<Timer>,
    pub hard_resets: u64,
}

impl FeedStatus {
    pub fn is_subscribed(&self) -> bool {
        self.state == ConnectionState::Subscribed
    }

    pub fn is_armed(&self, timer: Timer) -> bool {
        self.armed_timers.contains(&timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_states() {
        assert!(!ConnectionState::Idle.is_busy());
        assert!(ConnectionState::Connecting.is_busy());
        assert!(ConnectionState::Authenticating.is_busy());
        assert!(ConnectionState::Subscribed.is_busy());
        assert!(!ConnectionState::Closing.is_busy());
        assert!(!ConnectionState::Closed.is_busy());
    }

    #[test]
    fn test_default_status() {
        let status = FeedStatus::default();
        assert_eq!(status.state, ConnectionState::Idle);
        assert!(!status.is_subscribed());
        assert!(!status.is_armed(Timer::Heartbeat));
    }
}
