//! Session provider.
//!
//! The live feed needs two things from the query side of the API: where to
//! stream from, and whether streaming is enabled for a home.
//!
//! The feed engine depends only on [`SessionProvider`]. [`HttpSessionProvider`]
//! implements it against the GraphQL endpoint; tests supply fakes.

use std::future::Future;

use crate::error::SessionError;

/// Streaming endpoint and the credential to present in `connection_init`.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub url: String,
    pub token: String,
}

impl std::fmt::Debug for StreamEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEndpoint")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Capabilities consumed by the feed engine.
///
/// Both operations distinguish [`SessionError::AuthenticationDenied`] (sticky,
/// never retried) from [`SessionError::RateLimited`] and
/// [`SessionError::Transient`].
pub trait SessionProvider: Send + Sync + 'static {
    fn resolve_stream_endpoint(
        &self,
    ) -> impl Future<Output = Result<StreamEndpoint, SessionError>> + Send;

    fn is_streaming_enabled(
        &self,
        home_id: &str,
    ) -> impl Future<Output = Result<bool, SessionError>> + Send;
}

#[cfg(feature = "http")]
pub use http_provider::HttpSessionProvider;

#[cfg(feature = "http")]
mod http_provider {
    use std::sync::Arc;

    use async_lock::RwLock;

    use super::{SessionProvider, StreamEndpoint};
    use crate::config::ApiEndpoint;
    use crate::error::{HttpError, SessionError};
    use crate::http::TibberHttp;

    /// [`SessionProvider`] backed by the GraphQL query endpoint.
    ///
    /// The subscription URL rarely changes, so it is fetched once and reused
    /// until [`HttpSessionProvider::invalidate`] is called.
    #[derive(Clone)]
    pub struct HttpSessionProvider {
        http: TibberHttp,
        cached_url: Arc<RwLock<Option<String>>>,
    }

    impl HttpSessionProvider {
        pub fn new(endpoint: &ApiEndpoint) -> Result<Self, HttpError> {
            Ok(Self::from_http(TibberHttp::new(endpoint)?))
        }

        pub fn from_http(http: TibberHttp) -> Self {
            Self {
                http,
                cached_url: Arc::new(RwLock::new(None)),
            }
        }

        pub fn http(&self) -> &TibberHttp {
            &self.http
        }

        /// Forget the cached subscription URL.
        pub async fn invalidate(&self) {
            *self.cached_url.write().await = None;
        }
    }

    impl SessionProvider for HttpSessionProvider {
        async fn resolve_stream_endpoint(&self) -> Result<StreamEndpoint, SessionError> {
            let cached = self.cached_url.read().await.clone();
            let url = match cached {
                Some(url) => url,
                None => {
                    let url = self.http.websocket_subscription_url().await?;
                    tracing::debug!("Resolved websocket subscription URL: {}", url);
                    *self.cached_url.write().await = Some(url.clone());
                    url
                }
            };

            Ok(StreamEndpoint {
                url,
                token: self.http.api_key().await,
            })
        }

        async fn is_streaming_enabled(&self, home_id: &str) -> Result<bool, SessionError> {
            Ok(self.http.real_time_enabled(home_id).await?)
        }
    }
}
