//! Unified SDK error types.

use std::time::Duration;

use thiserror::Error;

/// Top-level SDK error.
#[derive(Error, Debug)]
pub enum SdkError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// HTTP-layer errors from the GraphQL query endpoint.
#[derive(Error, Debug)]
pub enum HttpError {
    #[cfg(feature = "http")]
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Server error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Unauthorized ({status})")]
    Unauthorized { status: u16 },

    #[error("GraphQL error: {0}")]
    GraphQl(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Timeout")]
    Timeout,
}

/// Errors from the live feed client handle.
///
/// The engine itself never returns errors to the caller; connection problems
/// arrive as [`crate::feed::FeedEvent`]s. These cover the handle's own
/// plumbing and the transport layer.
#[derive(Error, Debug, Clone)]
pub enum FeedError {
    #[error("Feed engine is not running")]
    EngineStopped,

    #[error("Command channel full")]
    CommandChannelFull,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Rate limited by server (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[cfg(feature = "feed")]
impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match err {
            Error::Http(resp) if resp.status().as_u16() == 429 => FeedError::RateLimited {
                retry_after: resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs),
            },
            Error::Http(resp) => {
                FeedError::ConnectionFailed(format!("HTTP error: {}", resp.status()))
            }
            Error::Url(e) => FeedError::InvalidUrl(e.to_string()),
            Error::Protocol(e) => FeedError::Protocol(e.to_string()),
            other => FeedError::ConnectionFailed(other.to_string()),
        }
    }
}

/// Errors returned by a [`crate::session::SessionProvider`].
///
/// The engine treats each variant differently: authentication failures halt
/// retries, rate limits engage the cooldown, everything else is retried with
/// backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Authentication denied: {0}")]
    AuthenticationDenied(String),

    #[error("Too many requests (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient session failure: {0}")]
    Transient(String),
}

impl From<HttpError> for SessionError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Unauthorized { status } => {
                SessionError::AuthenticationDenied(format!("HTTP {status}"))
            }
            HttpError::RateLimited { retry_after } => SessionError::RateLimited { retry_after },
            other => SessionError::Transient(other.to_string()),
        }
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing mandatory parameter: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Malformed config document: {0}")]
    Malformed(#[from] serde_json::Error),
}
