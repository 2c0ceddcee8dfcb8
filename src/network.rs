//! Network constants for the Tibber API.

/// Default GraphQL query endpoint.
pub const DEFAULT_QUERY_URL: &str = "https://api.tibber.com/v1-beta/gql";

/// WebSocket subprotocol spoken by the live feed.
pub const FEED_SUBPROTOCOL: &str = "graphql-transport-ws";

/// User agent the SDK identifies itself with.
pub const DEFAULT_USER_AGENT: &str = concat!("tibber-rs/", env!("CARGO_PKG_VERSION"));

/// Public demo token published by Tibber for testing.
pub const DEMO_TOKEN: &str = "5K4MVS-OjfWhK_4yrjOlFe1F6kJXPVf7eQYggo8ebAE";
