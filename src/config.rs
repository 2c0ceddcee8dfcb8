//! Feed configuration: endpoint, home, timeouts, thresholds, and the
//! live-measurement field selection that becomes the subscription document.
//!
//! There is exactly one canonical configuration type, [`FeedConfig`]. The
//! legacy camelCase JSON shape (with its deprecated `currentPhaseN` flags) is
//! accepted only through [`FeedConfig::from_json`], which maps it once.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::network::DEFAULT_QUERY_URL;

// ─── Defaults ────────────────────────────────────────────────────────────────

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_HARD_RESET_DELAY: Duration = Duration::from_secs(5);

// ─── Endpoint ────────────────────────────────────────────────────────────────

/// Where and as whom to talk to the API.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub query_url: String,
    pub api_key: String,
    /// Caller-supplied user agent, prepended to the SDK's own.
    pub user_agent: Option<String>,
}

impl ApiEndpoint {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            query_url: DEFAULT_QUERY_URL.to_string(),
            api_key: api_key.into(),
            user_agent: None,
        }
    }
}

impl std::fmt::Debug for ApiEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiEndpoint")
            .field("query_url", &self.query_url)
            .field("api_key", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

// ─── Field selection ─────────────────────────────────────────────────────────

/// A field of the `liveMeasurement` subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeasurementField {
    Timestamp,
    Power,
    LastMeterConsumption,
    AccumulatedConsumption,
    AccumulatedProduction,
    AccumulatedCost,
    AccumulatedReward,
    Currency,
    MinPower,
    AveragePower,
    MaxPower,
    PowerProduction,
    MinPowerProduction,
    MaxPowerProduction,
    LastMeterProduction,
    PowerFactor,
    VoltagePhase1,
    VoltagePhase2,
    VoltagePhase3,
    CurrentL1,
    CurrentL2,
    CurrentL3,
    SignalStrength,
}

impl MeasurementField {
    pub const ALL: [MeasurementField; 23] = [
        Self::Timestamp,
        Self::Power,
        Self::LastMeterConsumption,
        Self::AccumulatedConsumption,
        Self::AccumulatedProduction,
        Self::AccumulatedCost,
        Self::AccumulatedReward,
        Self::Currency,
        Self::MinPower,
        Self::AveragePower,
        Self::MaxPower,
        Self::PowerProduction,
        Self::MinPowerProduction,
        Self::MaxPowerProduction,
        Self::LastMeterProduction,
        Self::PowerFactor,
        Self::VoltagePhase1,
        Self::VoltagePhase2,
        Self::VoltagePhase3,
        Self::CurrentL1,
        Self::CurrentL2,
        Self::CurrentL3,
        Self::SignalStrength,
    ];

    /// GraphQL field name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Power => "power",
            Self::LastMeterConsumption => "lastMeterConsumption",
            Self::AccumulatedConsumption => "accumulatedConsumption",
            Self::AccumulatedProduction => "accumulatedProduction",
            Self::AccumulatedCost => "accumulatedCost",
            Self::AccumulatedReward => "accumulatedReward",
            Self::Currency => "currency",
            Self::MinPower => "minPower",
            Self::AveragePower => "averagePower",
            Self::MaxPower => "maxPower",
            Self::PowerProduction => "powerProduction",
            Self::MinPowerProduction => "minPowerProduction",
            Self::MaxPowerProduction => "maxPowerProduction",
            Self::LastMeterProduction => "lastMeterProduction",
            Self::PowerFactor => "powerFactor",
            Self::VoltagePhase1 => "voltagePhase1",
            Self::VoltagePhase2 => "voltagePhase2",
            Self::VoltagePhase3 => "voltagePhase3",
            Self::CurrentL1 => "currentL1",
            Self::CurrentL2 => "currentL2",
            Self::CurrentL3 => "currentL3",
            Self::SignalStrength => "signalStrength",
        }
    }
}

/// Ordered, duplicate-free selection of live-measurement fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveMeasurementFields {
    fields: Vec<MeasurementField>,
}

impl LiveMeasurementFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every field the subscription offers.
    pub fn all() -> Self {
        Self {
            fields: MeasurementField::ALL.to_vec(),
        }
    }

    pub fn with(mut self, field: MeasurementField) -> Self {
        self.insert(field);
        self
    }

    pub fn insert(&mut self, field: MeasurementField) {
        if !self.fields.contains(&field) {
            self.fields.push(field);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MeasurementField> {
        self.fields.iter()
    }

    /// Render the subscription document for `home_id`.
    ///
    /// An empty selection subscribes to `timestamp power`, the smallest
    /// useful live measurement.
    pub fn subscription_document(&self, home_id: &str) -> String {
        let mut doc = format!(
            "subscription{{liveMeasurement(homeId:\"{}\"){{",
            home_id.replace('\\', "\\\\").replace('"', "\\\"")
        );
        if self.fields.is_empty() {
            doc.push_str("timestamp power ");
        } else {
            let mut ordered = self.fields.clone();
            ordered.sort();
            for field in ordered {
                doc.push_str(field.as_str());
                doc.push(' ');
            }
        }
        doc.push_str("}}");
        doc
    }
}

// ─── FeedConfig ──────────────────────────────────────────────────────────────

/// Immutable configuration of one feed engine.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub endpoint: ApiEndpoint,
    /// Device identifier the live measurements belong to.
    pub home_id: String,
    /// Whether the engine starts connecting as soon as it is spawned.
    pub active: bool,
    /// Maximum silence between data frames while subscribed.
    pub idle_timeout: Duration,
    /// Deadline for transport open + `connection_ack`.
    pub connect_timeout: Duration,
    /// Consecutive failures before a hard reset.
    pub max_consecutive_failures: u32,
    /// Precomputed `subscription { liveMeasurement ... }` document.
    pub subscription: String,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long a subscription must stay healthy before backoff is forgiven.
    pub stable_after: Duration,
    pub rate_limit_cooldown: Duration,
    pub hard_reset_delay: Duration,
}

impl FeedConfig {
    pub fn builder(api_key: impl Into<String>, home_id: impl Into<String>) -> FeedConfigBuilder {
        FeedConfigBuilder::new(api_key, home_id)
    }

    /// Parse the camelCase JSON configuration shape.
    ///
    /// ```json
    /// { "active": true,
    ///   "apiEndpoint": { "apiKey": "...", "queryUrl": "..." },
    ///   "homeId": "...", "power": true, "currentPhase1": true }
    /// ```
    ///
    /// Deprecated `currentPhaseN` flags select the `currentLN` fields.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let legacy: LegacyConfig = serde_json::from_str(json)?;
        legacy.into_config()
    }
}

/// Builder for [`FeedConfig`]; defaults live in the constants above.
#[derive(Debug, Clone)]
pub struct FeedConfigBuilder {
    endpoint: ApiEndpoint,
    home_id: String,
    active: bool,
    idle_timeout: Duration,
    connect_timeout: Duration,
    max_consecutive_failures: u32,
    fields: LiveMeasurementFields,
    subscription: Option<String>,
    backoff_base: Duration,
    backoff_max: Duration,
    stable_after: Duration,
    rate_limit_cooldown: Duration,
    hard_reset_delay: Duration,
}

impl FeedConfigBuilder {
    fn new(api_key: impl Into<String>, home_id: impl Into<String>) -> Self {
        Self {
            endpoint: ApiEndpoint::new(api_key),
            home_id: home_id.into(),
            active: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            fields: LiveMeasurementFields::new(),
            subscription: None,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            stable_after: DEFAULT_STABLE_AFTER,
            rate_limit_cooldown: DEFAULT_RATE_LIMIT_COOLDOWN,
            hard_reset_delay: DEFAULT_HARD_RESET_DELAY,
        }
    }

    pub fn query_url(mut self, url: &str) -> Self {
        self.endpoint.query_url = url.to_string();
        self
    }

    pub fn user_agent(mut self, agent: &str) -> Self {
        self.endpoint.user_agent = Some(agent.to_string());
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_consecutive_failures(mut self, threshold: u32) -> Self {
        self.max_consecutive_failures = threshold;
        self
    }

    pub fn fields(mut self, fields: LiveMeasurementFields) -> Self {
        self.fields = fields;
        self
    }

    /// Use a hand-written subscription document instead of a field selection.
    pub fn subscription(mut self, document: &str) -> Self {
        self.subscription = Some(document.to_string());
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn stable_after(mut self, duration: Duration) -> Self {
        self.stable_after = duration;
        self
    }

    pub fn rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    pub fn hard_reset_delay(mut self, delay: Duration) -> Self {
        self.hard_reset_delay = delay;
        self
    }

    pub fn build(self) -> Result<FeedConfig, ConfigError> {
        if self.endpoint.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("apiEndpoint.apiKey"));
        }
        if self.endpoint.query_url.trim().is_empty() {
            return Err(ConfigError::Missing("apiEndpoint.queryUrl"));
        }
        if self.home_id.trim().is_empty() {
            return Err(ConfigError::Missing("homeId"));
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            return Err(ConfigError::Invalid {
                field: "backoff",
                reason: format!(
                    "base {:?} must be non-zero and not exceed max {:?}",
                    self.backoff_base, self.backoff_max
                ),
            });
        }
        if self.idle_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "timeout",
                reason: "idle and connect timeouts must be non-zero".to_string(),
            });
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid {
                field: "maxConsecutiveFailures",
                reason: "must be at least 1".to_string(),
            });
        }

        let subscription = self
            .subscription
            .unwrap_or_else(|| self.fields.subscription_document(&self.home_id));

        Ok(FeedConfig {
            endpoint: self.endpoint,
            home_id: self.home_id,
            active: self.active,
            idle_timeout: self.idle_timeout,
            connect_timeout: self.connect_timeout,
            max_consecutive_failures: self.max_consecutive_failures,
            subscription,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
            stable_after: self.stable_after,
            rate_limit_cooldown: self.rate_limit_cooldown,
            hard_reset_delay: self.hard_reset_delay,
        })
    }
}

// ─── Legacy JSON shape ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyEndpoint {
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    query_url: Option<String>,
    #[serde(default)]
    user_agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacyConfig {
    active: bool,
    api_endpoint: Option<LegacyEndpoint>,
    home_id: Option<String>,
    /// Milliseconds, as the JSON shape has always used.
    idle_timeout: Option<u64>,
    connect_timeout: Option<u64>,
    max_consecutive_failures: Option<u32>,
    timestamp: bool,
    power: bool,
    last_meter_consumption: bool,
    accumulated_consumption: bool,
    accumulated_production: bool,
    accumulated_cost: bool,
    accumulated_reward: bool,
    currency: bool,
    min_power: bool,
    average_power: bool,
    max_power: bool,
    power_production: bool,
    min_power_production: bool,
    max_power_production: bool,
    last_meter_production: bool,
    power_factor: bool,
    voltage_phase1: bool,
    voltage_phase2: bool,
    voltage_phase3: bool,
    #[serde(rename = "currentL1")]
    current_l1: bool,
    #[serde(rename = "currentL2")]
    current_l2: bool,
    #[serde(rename = "currentL3")]
    current_l3: bool,
    current_phase1: bool,
    current_phase2: bool,
    current_phase3: bool,
    signal_strength: bool,
}

impl LegacyConfig {
    fn fields(&self) -> LiveMeasurementFields {
        use MeasurementField as F;

        let flags = [
            (self.timestamp, F::Timestamp),
            (self.power, F::Power),
            (self.last_meter_consumption, F::LastMeterConsumption),
            (self.accumulated_consumption, F::AccumulatedConsumption),
            (self.accumulated_production, F::AccumulatedProduction),
            (self.accumulated_cost, F::AccumulatedCost),
            (self.accumulated_reward, F::AccumulatedReward),
            (self.currency, F::Currency),
            (self.min_power, F::MinPower),
            (self.average_power, F::AveragePower),
            (self.max_power, F::MaxPower),
            (self.power_production, F::PowerProduction),
            (self.min_power_production, F::MinPowerProduction),
            (self.max_power_production, F::MaxPowerProduction),
            (self.last_meter_production, F::LastMeterProduction),
            (self.power_factor, F::PowerFactor),
            (self.voltage_phase1, F::VoltagePhase1),
            (self.voltage_phase2, F::VoltagePhase2),
            (self.voltage_phase3, F::VoltagePhase3),
            (self.current_l1 || self.current_phase1, F::CurrentL1),
            (self.current_l2 || self.current_phase2, F::CurrentL2),
            (self.current_l3 || self.current_phase3, F::CurrentL3),
            (self.signal_strength, F::SignalStrength),
        ];

        let mut fields = LiveMeasurementFields::new();
        for (selected, field) in flags {
            if selected {
                fields.insert(field);
            }
        }
        fields
    }

    fn into_config(self) -> Result<FeedConfig, ConfigError> {
        let fields = self.fields();
        let endpoint = self
            .api_endpoint
            .ok_or(ConfigError::Missing("apiEndpoint"))?;
        let home_id = self.home_id.ok_or(ConfigError::Missing("homeId"))?;

        let mut builder = FeedConfig::builder(endpoint.api_key, home_id)
            .active(self.active)
            .fields(fields);
        if let Some(url) = endpoint.query_url.as_deref() {
            builder = builder.query_url(url);
        }
        if let Some(agent) = endpoint.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }
        if let Some(ms) = self.idle_timeout {
            builder = builder.idle_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.connect_timeout {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(threshold) = self.max_consecutive_failures {
            builder = builder.max_consecutive_failures(threshold);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = FeedConfig::builder("token", "home-1").build().unwrap();
        assert!(!config.active);
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.max_consecutive_failures, 10);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_max, Duration::from_secs(3600));
        assert_eq!(config.endpoint.query_url, DEFAULT_QUERY_URL);
        assert_eq!(
            config.subscription,
            "subscription{liveMeasurement(homeId:\"home-1\"){timestamp power }}"
        );
    }

    #[test]
    fn test_builder_rejects_missing_home() {
        let err = FeedConfig::builder("token", "  ").build().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("homeId")));
    }

    #[test]
    fn test_builder_rejects_missing_token() {
        let err = FeedConfig::builder("", "home").build().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("apiEndpoint.apiKey")));
    }

    #[test]
    fn test_builder_rejects_inverted_backoff() {
        let err = FeedConfig::builder("token", "home")
            .backoff(Duration::from_secs(10), Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "backoff", .. }));
    }

    #[test]
    fn test_document_keeps_canonical_order_without_duplicates() {
        let fields = LiveMeasurementFields::new()
            .with(MeasurementField::CurrentL1)
            .with(MeasurementField::Power)
            .with(MeasurementField::Timestamp)
            .with(MeasurementField::Power);
        assert_eq!(
            fields.subscription_document("abc"),
            "subscription{liveMeasurement(homeId:\"abc\"){timestamp power currentL1 }}"
        );
    }

    #[test]
    fn test_document_escapes_home_id() {
        let doc = LiveMeasurementFields::new().subscription_document("a\"b");
        assert!(doc.contains("homeId:\"a\\\"b\""));
    }

    #[test]
    fn test_explicit_subscription_wins() {
        let config = FeedConfig::builder("token", "home")
            .fields(LiveMeasurementFields::all())
            .subscription("subscription{x}")
            .build()
            .unwrap();
        assert_eq!(config.subscription, "subscription{x}");
    }

    #[test]
    fn test_from_json_maps_deprecated_phase_flags() {
        let json = r#"{
            "active": true,
            "apiEndpoint": { "apiKey": "token", "queryUrl": "https://example.test/gql" },
            "homeId": "home-9",
            "timestamp": true,
            "power": true,
            "currentPhase1": true,
            "currentL2": true,
            "idleTimeout": 15000
        }"#;
        let config = FeedConfig::from_json(json).unwrap();
        assert!(config.active);
        assert_eq!(config.endpoint.query_url, "https://example.test/gql");
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
        assert_eq!(
            config.subscription,
            "subscription{liveMeasurement(homeId:\"home-9\"){timestamp power currentL1 currentL2 }}"
        );
    }

    #[test]
    fn test_from_json_alias_and_new_flag_select_once() {
        let json = r#"{
            "apiEndpoint": { "apiKey": "token" },
            "homeId": "h",
            "currentPhase3": true,
            "currentL3": true
        }"#;
        let config = FeedConfig::from_json(json).unwrap();
        assert_eq!(config.subscription.matches("currentL3").count(), 1);
    }

    #[test]
    fn test_from_json_requires_endpoint() {
        let err = FeedConfig::from_json(r#"{ "homeId": "h" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("apiEndpoint")));
    }

    #[test]
    fn test_endpoint_debug_redacts_key() {
        let rendered = format!("{:?}", ApiEndpoint::new("secret-token"));
        assert!(!rendered.contains("secret-token"));
    }
}
