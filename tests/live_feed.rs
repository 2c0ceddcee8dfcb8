//! Integration tests against the public Tibber API.
//!
//! These tests use the demo token (or `TIBBER_TOKEN` / `TIBBER_HOME_ID` from
//! the environment or a `.env` file) and exercise the full
//! query → subscribe → receive → close lifecycle.
//!
//! All tests are `#[ignore]` because they require network access.
//!
//! Run with:
//! ```bash
//! cargo test --test live_feed -- --ignored
//! ```

#![cfg(all(feature = "http", feature = "feed"))]

use std::env;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;

use tibber::config::{ApiEndpoint, FeedConfig, LiveMeasurementFields, MeasurementField};
use tibber::feed::{ConnectionState, FeedClient, FeedEvent};
use tibber::http::TibberHttp;
use tibber::network::DEMO_TOKEN;

/// Home attached to the demo account.
const DEMO_HOME_ID: &str = "96a14971-525a-4420-aae9-e5aedaa129ff";
const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn credentials() -> (String, String) {
    dotenvy::dotenv().ok();
    let token = env::var("TIBBER_TOKEN").unwrap_or_else(|_| DEMO_TOKEN.to_string());
    let home_id = env::var("TIBBER_HOME_ID").unwrap_or_else(|_| DEMO_HOME_ID.to_string());
    (token, home_id)
}

fn live_config() -> FeedConfig {
    let (token, home_id) = credentials();
    FeedConfig::builder(token, home_id)
        .user_agent("tibber-rs-integration-tests")
        .fields(
            LiveMeasurementFields::new()
                .with(MeasurementField::Timestamp)
                .with(MeasurementField::Power)
                .with(MeasurementField::AccumulatedConsumption),
        )
        .active(true)
        .build()
        .expect("valid config")
}

/// Wait for the next event that matches the predicate, ignoring others.
async fn next_matching(client: &FeedClient, predicate: impl Fn(&FeedEvent) -> bool) -> FeedEvent {
    let events = client.events();
    tokio::pin!(events);

    timeout(TEST_TIMEOUT, async {
        while let Some(ev) = events.next().await {
            if predicate(&ev) {
                return ev;
            }
        }
        panic!("event stream ended without a matching event");
    })
    .await
    .expect("timed out waiting for matching event")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore]
async fn query_websocket_subscription_url() {
    let (token, _) = credentials();
    let http = TibberHttp::new(&ApiEndpoint::new(token)).expect("client");
    let url = http
        .websocket_subscription_url()
        .await
        .expect("subscription url");
    assert!(url.starts_with("wss://"), "unexpected url: {url}");
}

#[tokio::test]
#[ignore]
async fn demo_home_has_real_time_enabled() {
    let (token, home_id) = credentials();
    let http = TibberHttp::new(&ApiEndpoint::new(token)).expect("client");
    assert!(http.real_time_enabled(&home_id).await.expect("entitlement"));
}

#[tokio::test]
#[ignore]
async fn feed_receives_measurements() {
    let client = FeedClient::new(live_config()).expect("feed client");

    next_matching(&client, |ev| matches!(ev, FeedEvent::ConnectionAck)).await;
    let event = next_matching(&client, |ev| matches!(ev, FeedEvent::Data(_))).await;

    match event {
        FeedEvent::Data(payload) => {
            let measurement = &payload["liveMeasurement"];
            assert!(measurement["timestamp"].is_string(), "payload: {payload}");
            assert!(measurement["power"].is_number(), "payload: {payload}");
        }
        other => panic!("expected Data, got: {other:?}"),
    }

    client.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn graceful_close() {
    let client = FeedClient::new(live_config()).expect("feed client");
    next_matching(&client, |ev| matches!(ev, FeedEvent::ConnectionAck)).await;
    assert!(client.status().is_subscribed());

    client.close().expect("close");
    let mut status = client.watch_status();
    let closed = timeout(TEST_TIMEOUT, status.wait_for(|s| s.state == ConnectionState::Closed))
        .await
        .expect("timed out waiting for close")
        .expect("engine stopped")
        .clone();
    assert!(closed.armed_timers.is_empty());

    client.shutdown().await;
}
