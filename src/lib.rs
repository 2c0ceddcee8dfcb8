//! # Tibber
//!
//! Rust client for the Tibber API: GraphQL queries over HTTP and a
//! self-healing live-measurement feed over `graphql-transport-ws`.
//!
//! ## Architecture
//!
//! 1. **Core**: configuration, field selection, errors (always available)
//! 2. **Session**: the `SessionProvider` capability the feed consumes
//! 3. **HTTP API**: `TibberHttp` query client and `HttpSessionProvider`
//! 4. **Live feed**: `FeedClient`, a background tokio task that keeps one
//!    subscription alive with backoff, cooldown and hard-reset recovery
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//! use tibber::prelude::*;
//!
//! let config = FeedConfig::builder(DEMO_TOKEN, "96a14971-525a-4420-aae9-e5aedaa129ff")
//!     .fields(LiveMeasurementFields::all())
//!     .active(true)
//!     .build()?;
//!
//! let feed = FeedClient::new(config)?;
//! let mut data = feed.data();
//! while let Some(measurement) = data.next().await {
//!     println!("{measurement}");
//! }
//! ```

// ── Layer 1: Core ────────────────────────────────────────────────────────────

/// Unified SDK error types.
pub mod error;

/// Network URL constants.
pub mod network;

/// Feed configuration and live-measurement field selection.
pub mod config;

/// `User-Agent` header construction.
pub mod user_agent;

// ── Layer 2: Session ─────────────────────────────────────────────────────────

/// Streaming endpoint lookup and entitlement checks.
pub mod session;

// ── Layer 3: HTTP API ────────────────────────────────────────────────────────

/// GraphQL query client.
#[cfg(feature = "http")]
pub mod http;

// ── Layer 4: Live feed ───────────────────────────────────────────────────────

/// Live measurement feed engine.
#[cfg(feature = "feed")]
pub mod feed;

// ── Prelude ──────────────────────────────────────────────────────────────────

pub mod prelude {
    // Configuration
    pub use crate::config::{ApiEndpoint, FeedConfig, LiveMeasurementFields, MeasurementField};

    // Errors
    pub use crate::error::{ConfigError, FeedError, HttpError, SdkError, SessionError};

    // Network
    pub use crate::network::{DEFAULT_QUERY_URL, DEMO_TOKEN};

    // Session
    pub use crate::session::{SessionProvider, StreamEndpoint};
    #[cfg(feature = "http")]
    pub use crate::session::HttpSessionProvider;

    // HTTP client
    #[cfg(feature = "http")]
    pub use crate::http::TibberHttp;

    // Live feed
    #[cfg(feature = "feed")]
    pub use crate::feed::{
        ConnectionState, FeedClient, FeedEvent, FeedStatus, RateLimitGuard, Timer,
    };
}
