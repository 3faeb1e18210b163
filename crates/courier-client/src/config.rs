// Client defaults, endpoint presets and env/YAML overrides.
use anyhow::{Context, Result};
use courier_transport::{Credentials, Endpoint};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::ClientError;

pub const PRODUCTION_GATEWAY_URI: &str = "apn://gateway.push.apple.com:2195";
pub const PRODUCTION_FEEDBACK_URI: &str = "apn://feedback.push.apple.com:2196";
pub const DEVELOPMENT_GATEWAY_URI: &str = "apn://gateway.sandbox.push.apple.com:2195";
pub const DEVELOPMENT_FEEDBACK_URI: &str = "apn://feedback.sandbox.push.apple.com:2196";

pub(crate) const DEFAULT_POOL_SIZE: usize = 3;
pub(crate) const DEFAULT_MAX_CONCURRENT_OPENS: usize = 4;
pub(crate) const DEFAULT_OPEN_ATTEMPTS: u32 = 5;
pub(crate) const DEFAULT_OPEN_BACKOFF_MS: u64 = 200;
pub(crate) const DEFAULT_OPEN_BACKOFF_MAX_MS: u64 = 5_000;
pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_GRACE_PERIOD_MS: u64 = 1_000;
pub(crate) const DEFAULT_PACKET_SIZE: usize = 100;
pub(crate) const DEFAULT_TEARDOWN_TIMEOUT_MS: u64 = 2_000;
pub(crate) const DEFAULT_MAX_STALLED_SEGMENTS: u32 = 3;
pub(crate) const DEFAULT_TRUNCATE_MARKER: &str = "...";

/// Largest payload the binary gateway accepts.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 2048;

/// Everything the client needs to reach the gateway and pace a batch.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub gateway: Endpoint,
    pub feedback: Endpoint,
    pub credentials: Credentials,
    /// Warm connections kept ready for the delivery engine.
    pub pool_size: usize,
    pub max_concurrent_opens: usize,
    pub open_attempts: u32,
    /// Base delay between open attempts; doubles per attempt.
    pub open_backoff: Duration,
    pub open_backoff_max: Duration,
    pub connect_timeout: Duration,
    /// How long to wait for a trailing error after the last write.
    pub grace_period: Duration,
    pub packet_size: usize,
    pub max_payload_bytes: usize,
    pub truncate_alert: bool,
    pub truncate_marker: String,
    pub teardown_timeout: Duration,
    pub max_stalled_segments: u32,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct ClientConfigOverride {
    gateway_uri: Option<String>,
    feedback_uri: Option<String>,
    pool_size: Option<usize>,
    max_concurrent_opens: Option<usize>,
    open_attempts: Option<u32>,
    open_backoff_ms: Option<u64>,
    open_backoff_max_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    grace_period_ms: Option<u64>,
    packet_size: Option<usize>,
    max_payload_bytes: Option<usize>,
    truncate_alert: Option<bool>,
    truncate_marker: Option<String>,
    teardown_timeout_ms: Option<u64>,
    max_stalled_segments: Option<u32>,
}

impl ClientConfig {
    /// Sandbox endpoints with default pacing.
    pub fn development(credentials: Credentials) -> Self {
        Self::with_endpoints(
            credentials,
            Endpoint::new("gateway.sandbox.push.apple.com", 2195),
            Endpoint::new("feedback.sandbox.push.apple.com", 2196),
        )
    }

    pub fn production(credentials: Credentials) -> Self {
        Self::with_endpoints(
            credentials,
            Endpoint::new("gateway.push.apple.com", 2195),
            Endpoint::new("feedback.push.apple.com", 2196),
        )
    }

    pub fn with_endpoints(credentials: Credentials, gateway: Endpoint, feedback: Endpoint) -> Self {
        Self {
            gateway,
            feedback,
            credentials,
            pool_size: DEFAULT_POOL_SIZE,
            max_concurrent_opens: DEFAULT_MAX_CONCURRENT_OPENS,
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            open_backoff: Duration::from_millis(DEFAULT_OPEN_BACKOFF_MS),
            open_backoff_max: Duration::from_millis(DEFAULT_OPEN_BACKOFF_MAX_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            packet_size: DEFAULT_PACKET_SIZE,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            truncate_alert: false,
            truncate_marker: DEFAULT_TRUNCATE_MARKER.to_string(),
            teardown_timeout: Duration::from_millis(DEFAULT_TEARDOWN_TIMEOUT_MS),
            max_stalled_segments: DEFAULT_MAX_STALLED_SEGMENTS,
        }
    }

    /// Development defaults, then environment variables, then the YAML file
    /// at `config_path` (or `COURIER_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(credentials: Credentials, config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env(credentials)?;
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config)?;
        }
        Ok(config)
    }

    fn from_env(credentials: Credentials) -> Result<Self> {
        let mut config = Self::development(credentials);
        if let Ok(value) = std::env::var("COURIER_GATEWAY_URI") {
            config.gateway = parse_endpoint("COURIER_GATEWAY_URI", &value)?;
        }
        if let Ok(value) = std::env::var("COURIER_FEEDBACK_URI") {
            config.feedback = parse_endpoint("COURIER_FEEDBACK_URI", &value)?;
        }
        if let Some(value) = read_usize_env("COURIER_POOL_SIZE") {
            config.pool_size = value;
        }
        if let Some(value) = read_usize_env("COURIER_MAX_CONCURRENT_OPENS") {
            config.max_concurrent_opens = value;
        }
        if let Some(value) = read_u32_env("COURIER_OPEN_ATTEMPTS") {
            config.open_attempts = value;
        }
        if let Some(value) = read_millis_env("COURIER_OPEN_BACKOFF_MS") {
            config.open_backoff = value;
        }
        if let Some(value) = read_millis_env("COURIER_OPEN_BACKOFF_MAX_MS") {
            config.open_backoff_max = value;
        }
        if let Some(value) = read_millis_env("COURIER_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = value;
        }
        if let Some(value) = read_millis_env("COURIER_GRACE_PERIOD_MS") {
            config.grace_period = value;
        }
        if let Some(value) = read_usize_env("COURIER_PACKET_SIZE") {
            config.packet_size = value;
        }
        if let Some(value) = read_usize_env("COURIER_MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = value;
        }
        if let Some(value) = read_bool_env("COURIER_TRUNCATE_ALERT") {
            config.truncate_alert = value;
        }
        if let Some(value) = read_millis_env("COURIER_TEARDOWN_TIMEOUT_MS") {
            config.teardown_timeout = value;
        }
        if let Some(value) = read_u32_env("COURIER_MAX_STALLED_SEGMENTS") {
            config.max_stalled_segments = value;
        }
        Ok(config)
    }

    /// Reject settings that would stall or spin a batch.
    pub fn validate(&self) -> std::result::Result<(), ClientError> {
        let zero = |field: &str| -> std::result::Result<(), ClientError> {
            Err(ClientError::Config(format!("{field} must be greater than zero")))
        };
        if self.pool_size == 0 {
            return zero("pool_size");
        }
        if self.max_concurrent_opens == 0 {
            return zero("max_concurrent_opens");
        }
        if self.open_attempts == 0 {
            return zero("open_attempts");
        }
        if self.packet_size == 0 {
            return zero("packet_size");
        }
        if self.max_payload_bytes == 0 {
            return zero("max_payload_bytes");
        }
        if self.max_stalled_segments == 0 {
            return zero("max_stalled_segments");
        }
        if self.credentials.is_empty() {
            return Err(ClientError::Config("credentials carry no certificate".to_string()));
        }
        Ok(())
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) -> Result<()> {
        if let Some(value) = &self.gateway_uri {
            config.gateway = parse_endpoint("gateway_uri", value)?;
        }
        if let Some(value) = &self.feedback_uri {
            config.feedback = parse_endpoint("feedback_uri", value)?;
        }
        if let Some(value) = self.pool_size
            && value > 0
        {
            config.pool_size = value;
        }
        if let Some(value) = self.max_concurrent_opens
            && value > 0
        {
            config.max_concurrent_opens = value;
        }
        if let Some(value) = self.open_attempts
            && value > 0
        {
            config.open_attempts = value;
        }
        if let Some(value) = self.open_backoff_ms
            && value > 0
        {
            config.open_backoff = Duration::from_millis(value);
        }
        if let Some(value) = self.open_backoff_max_ms
            && value > 0
        {
            config.open_backoff_max = Duration::from_millis(value);
        }
        if let Some(value) = self.connect_timeout_ms
            && value > 0
        {
            config.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.grace_period_ms
            && value > 0
        {
            config.grace_period = Duration::from_millis(value);
        }
        if let Some(value) = self.packet_size
            && value > 0
        {
            config.packet_size = value;
        }
        if let Some(value) = self.max_payload_bytes
            && value > 0
        {
            config.max_payload_bytes = value;
        }
        if let Some(value) = self.truncate_alert {
            config.truncate_alert = value;
        }
        if let Some(value) = &self.truncate_marker {
            config.truncate_marker = value.clone();
        }
        if let Some(value) = self.teardown_timeout_ms
            && value > 0
        {
            config.teardown_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.max_stalled_segments
            && value > 0
        {
            config.max_stalled_segments = value;
        }
        Ok(())
    }
}

fn parse_endpoint(source: &str, value: &str) -> Result<Endpoint> {
    value
        .parse::<Endpoint>()
        .with_context(|| format!("parse {source}"))
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_u32_env(key: &str) -> Option<u32> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
}

fn read_millis_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}
