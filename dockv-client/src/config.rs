//! # Client Configuration
//!
//! Purpose: Collect every knob the client, pool, connections and discovery
//! loop read, with the defaults the server fleet expects.
//!
//! ## Design Principles
//! 1. **Plain Data**: `ClientConfig` is a `Default` + serde struct so it can
//!    be built in code or loaded from JSON.
//! 2. **Milliseconds on the Wire**: Durations serialize as `*_ms` integers.
//! 3. **Validate Once**: `Client::new` calls `validate` before spawning
//!    anything.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2020;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);
const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_millis(1_000);
const DEFAULT_DNS_CHECK_INTERVAL: Duration = Duration::from_millis(60_000);
const DEFAULT_DNS_RETRIES: u32 = 3;
const DEFAULT_RETRY_MIN_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_MAX_TIMEOUT: Duration = Duration::from_millis(10_000);
const DEFAULT_RETRY_FACTOR: f64 = 2.0;

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Literal IP address or DNS name of the service.
    pub host: String,
    /// Service port, applied to every resolved address.
    pub port: u16,
    /// Bound on a single connect attempt.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Ceiling on concurrently open connections.
    pub max_connections: usize,
    /// Accepted for compatibility; idle eviction is not performed.
    #[serde(rename = "max_idle_time_ms", with = "option_duration_ms")]
    pub max_idle_time: Option<Duration>,
    /// Default timeout for `ping` when the caller gives none.
    #[serde(rename = "ping_timeout_ms", with = "option_duration_ms")]
    pub ping_timeout: Option<Duration>,
    /// Discovery settings, used only when `host` is a DNS name.
    pub dns: DnsConfig,
    /// Connect retry/backoff policy.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_idle_time: None,
            ping_timeout: None,
            dns: DnsConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for `host:port` with defaults elsewhere.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            ..ClientConfig::default()
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_dns(mut self, dns: DnsConfig) -> Self {
        self.dns = dns;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Loads a configuration from JSON, validating it.
    pub fn from_json(text: &str) -> ClientResult<Self> {
        let config: ClientConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the client cannot run with.
    pub fn validate(&self) -> ClientResult<()> {
        if self.host.trim().is_empty() {
            return Err(ClientError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ClientError::Config("port must not be zero".into()));
        }
        if self.max_connections == 0 {
            return Err(ClientError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::Config(
                "connect_timeout must be greater than zero".into(),
            ));
        }
        if self.dns.check_interval.is_zero() {
            return Err(ClientError::Config(
                "dns.check_interval must be greater than zero".into(),
            ));
        }
        self.retry.validate()
    }
}

/// DNS discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Explicit name servers; empty means the resolver defaults.
    pub resolvers: Vec<IpAddr>,
    /// Per-query timeout.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Pause between discovery passes.
    #[serde(rename = "check_interval_ms", with = "duration_ms")]
    pub check_interval: Duration,
    /// Query attempts per resolution.
    pub retries: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            resolvers: Vec::new(),
            timeout: DEFAULT_DNS_TIMEOUT,
            check_interval: DEFAULT_DNS_CHECK_INTERVAL,
            retries: DEFAULT_DNS_RETRIES,
        }
    }
}

/// Connect retry policy.
///
/// The delay before retry `n` (1-based) is
/// `min_timeout * factor^(n-1)`, capped at `max_timeout`, then jittered by
/// `±jitter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt; `None` retries forever.
    pub retries: Option<u32>,
    #[serde(rename = "min_timeout_ms", with = "duration_ms")]
    pub min_timeout: Duration,
    #[serde(rename = "max_timeout_ms", with = "duration_ms")]
    pub max_timeout: Duration,
    pub factor: f64,
    /// Jitter fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: None,
            min_timeout: DEFAULT_RETRY_MIN_TIMEOUT,
            max_timeout: DEFAULT_RETRY_MAX_TIMEOUT,
            factor: DEFAULT_RETRY_FACTOR,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// A policy giving up after `retries` retries.
    pub fn bounded(retries: u32) -> Self {
        RetryPolicy {
            retries: Some(retries),
            ..RetryPolicy::default()
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout = min;
        self.max_timeout = max;
        self
    }

    fn validate(&self) -> ClientResult<()> {
        if self.min_timeout > self.max_timeout {
            return Err(ClientError::Config(
                "retry.min_timeout must not exceed retry.max_timeout".into(),
            ));
        }
        if self.factor.is_nan() || self.factor < 1.0 {
            return Err(ClientError::Config("retry.factor must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ClientError::Config(
                "retry.jitter must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
