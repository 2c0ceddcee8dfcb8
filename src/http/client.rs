//! GraphQL query client: `TibberHttp`.
//!
//! A thin POST wrapper: `{ query, variables }` in, `data` out. Also hosts the
//! two queries the live feed needs from the session: the WebSocket
//! subscription URL and the per-home real-time entitlement.

use std::sync::Arc;
use std::time::Duration;

use async_lock::RwLock;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ApiEndpoint;
use crate::error::HttpError;
use crate::user_agent::UserAgent;

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Requests never time out faster than this.
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

const GQL_WEBSOCKET_SUBSCRIPTION_URL: &str = "{viewer{websocketSubscriptionUrl}}";

const GQL_HOME_REAL_TIME: &str = "query getHomeRealTime($homeId:ID!){viewer{home(id:$homeId){features{realTimeConsumptionEnabled}}}}";

#[derive(Serialize)]
struct QueryBody<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    variables: Option<&'a Value>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct GraphQlErrorEntry {
    message: String,
    #[serde(default)]
    extensions: Option<Value>,
}

impl GraphQlErrorEntry {
    fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

/// GraphQL client for the Tibber query endpoint.
pub struct TibberHttp {
    query_url: String,
    client: Client,
    /// Bearer token. Swappable so a rejected credential can be replaced
    /// without rebuilding the client.
    api_key: Arc<RwLock<String>>,
    user_agent: UserAgent,
}

impl TibberHttp {
    pub fn new(endpoint: &ApiEndpoint) -> Result<Self, HttpError> {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &ApiEndpoint, timeout: Duration) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout.max(MIN_REQUEST_TIMEOUT))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            query_url: endpoint.query_url.trim_end_matches('/').to_string(),
            client,
            api_key: Arc::new(RwLock::new(endpoint.api_key.clone())),
            user_agent: UserAgent::new(endpoint.user_agent.as_deref()),
        })
    }

    pub fn query_url(&self) -> &str {
        &self.query_url
    }

    pub fn user_agent(&self) -> &UserAgent {
        &self.user_agent
    }

    /// Replace the bearer token used for subsequent requests.
    pub async fn set_api_key(&self, api_key: &str) {
        *self.api_key.write().await = api_key.to_string();
    }

    pub(crate) async fn api_key(&self) -> String {
        self.api_key.read().await.clone()
    }

    // ── Session queries ──────────────────────────────────────────────────

    /// `viewer.websocketSubscriptionUrl`.
    pub async fn websocket_subscription_url(&self) -> Result<String, HttpError> {
        let data: Value = self.query(GQL_WEBSOCKET_SUBSCRIPTION_URL, None).await?;
        data.pointer("/viewer/websocketSubscriptionUrl")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                HttpError::UnexpectedResponse(
                    "websocket subscription URL not found in response".to_string(),
                )
            })
    }

    /// `viewer.home(id).features.realTimeConsumptionEnabled`, `false` when absent.
    pub async fn real_time_enabled(&self, home_id: &str) -> Result<bool, HttpError> {
        let variables = serde_json::json!({ "homeId": home_id });
        let data: Value = self.query(GQL_HOME_REAL_TIME, Some(&variables)).await?;
        Ok(data
            .pointer("/viewer/home/features/realTimeConsumptionEnabled")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    // ── Generic query ────────────────────────────────────────────────────

    /// Run a GraphQL document and decode its `data` member.
    pub async fn query<T: DeserializeOwned>(
        &self,
        document: &str,
        variables: Option<&Value>,
    ) -> Result<T, HttpError> {
        let body = QueryBody {
            query: document,
            variables,
        };
        let token = self.api_key().await;

        let resp = self
            .client
            .post(&self.query_url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, self.user_agent.as_str())
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
        let text = resp.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(status_error(status, retry_after, text));
        }

        let parsed: GraphQlResponse = serde_json::from_str(&text).map_err(|e| {
            tracing::debug!("Unparseable GraphQL response: {}", text);
            HttpError::UnexpectedResponse(e.to_string())
        })?;

        if let Some(first) = parsed.errors.first() {
            if parsed
                .errors
                .iter()
                .any(|e| matches!(e.code(), Some("UNAUTHENTICATED") | Some("UNAUTHORIZED")))
            {
                return Err(HttpError::Unauthorized {
                    status: status.as_u16(),
                });
            }
            if parsed.data.as_ref().map_or(true, Value::is_null) {
                return Err(HttpError::GraphQl(first.message.clone()));
            }
            tracing::warn!("GraphQL partial response: {}", first.message);
        }

        let data = parsed.data.unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| HttpError::UnexpectedResponse(e.to_string()))
    }
}

impl Clone for TibberHttp {
    fn clone(&self) -> Self {
        Self {
            query_url: self.query_url.clone(),
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout
    } else {
        HttpError::Reqwest(err)
    }
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, body: String) -> HttpError {
    match status.as_u16() {
        401 | 403 => HttpError::Unauthorized {
            status: status.as_u16(),
        },
        429 => HttpError::RateLimited { retry_after },
        code => HttpError::ServerError {
            status: code,
            body: if body.is_empty() {
                "Empty response from server".to_string()
            } else {
                body
            },
        },
    }
}

/// `Retry-After` in its delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
