//! Transport seam between the engine and the WebSocket library.
//!
//! The engine only sees a boxed sink/stream pair of tungstenite
//! [`Message`]s. [`TungsteniteConnector`] produces one over TCP/TLS; tests
//! plug in an in-memory [`Connector`].

use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{SEC_WEBSOCKET_PROTOCOL, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::error::FeedError;
use crate::network::FEED_SUBPROTOCOL;
use crate::user_agent::UserAgent;

pub type FeedSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FeedStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// One open duplex connection.
pub struct Transport {
    pub sink: FeedSink,
    pub stream: FeedStream,
}

impl Transport {
    pub fn new(sink: FeedSink, stream: FeedStream) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Transport { .. }")
    }
}

/// Opens transports for the engine.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str) -> impl Future<Output = Result<Transport, FeedError>> + Send;
}

/// Default connector: `tokio-tungstenite` with the `graphql-transport-ws`
/// subprotocol and the SDK `User-Agent` on the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    user_agent: UserAgent,
}

impl TungsteniteConnector {
    pub fn new(user_agent: UserAgent) -> Self {
        Self { user_agent }
    }
}

impl Connector for TungsteniteConnector {
    async fn open(&self, url: &str) -> Result<Transport, FeedError> {
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(FEED_SUBPROTOCOL),
        );
        let agent = HeaderValue::from_str(self.user_agent.as_str())
            .map_err(|e| FeedError::ConnectionFailed(format!("Invalid user agent: {}", e)))?;
        headers.insert(USER_AGENT, agent);

        let (ws_stream, _response) = connect_async(request).await?;
        tracing::debug!("WebSocket transport open: {}", url);

        let (sink, stream) = ws_stream.split();
        Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_websocket_scheme_is_rejected_before_dialing() {
        let connector = TungsteniteConnector::default();
        let err = connector.open("http://example.test/feed").await.unwrap_err();
        assert!(matches!(err, FeedError::InvalidUrl(_)), "{err:?}");
    }
}
