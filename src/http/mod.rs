//! HTTP layer: `TibberHttp`, the GraphQL query client.

pub mod client;

pub use client::TibberHttp;
pub use crate::user_agent::UserAgent;
