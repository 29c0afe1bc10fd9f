//! Configuration for the NERO collaboration runtime.
//!
//! Provides [`NeroConfig`] for runtime-wide defaults and [`EndpointConfig`] for
//! describing a single tool endpoint. Users construct these manually; endpoint
//! catalogs may also be loaded from JSON with [`NeroConfig::endpoints_from_json`].
//!
//! # Example
//!
//! ```rust
//! use nero::config::{NeroConfig, Transport};
//! use std::time::Duration;
//!
//! let config = NeroConfig::default();
//! let endpoint = config
//!     .endpoint("epa-echo", Transport::Http { url: "http://localhost:8080".into() })
//!     .with_max_retries(5)
//!     .with_retry_delay(Duration::from_millis(250));
//!
//! assert_eq!(endpoint.max_retries, 5);
//! assert_eq!(endpoint.timeout, config.default_timeout);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// How a tool endpoint is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Transport {
    /// An in-process pipe, resolved by name against locally registered protocols.
    InProcess { name: String },
    /// An HTTP tool server.
    Http { url: String },
    /// A socket stream speaking newline-delimited JSON.
    Socket { address: String },
}

impl Transport {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::InProcess { .. } => "in-process",
            Transport::Http { .. } => "http",
            Transport::Socket { .. } => "socket",
        }
    }
}

/// Immutable description of one tool endpoint. One config backs exactly one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub transport: Transport,
    /// Per-attempt timeout.
    #[serde(with = "duration_ms", default = "default_timeout")]
    pub timeout: Duration,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for linear backoff (`retry_delay * attempt_number`).
    #[serde(with = "duration_ms", default = "default_retry_delay")]
    pub retry_delay: Duration,
}

impl EndpointConfig {
    /// Create a config with the crate defaults (30s timeout, 3 retries, 1s base delay).
    pub fn new(id: impl Into<String>, transport: Transport) -> Self {
        Self {
            id: id.into(),
            transport,
            timeout: default_timeout(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: default_retry_delay(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

fn default_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT_MS)
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(DEFAULT_RETRY_DELAY_MS)
}

/// Runtime-wide defaults.
///
/// This struct is intentionally minimal and users construct it however they want.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeroConfig {
    /// Timeout applied to endpoints created through [`NeroConfig::endpoint`].
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    pub default_retry_delay: Duration,
    /// Capacity of each client's recent-error ring.
    pub error_ring_capacity: usize,
    /// Sessions idle for longer than this are eligible for expiry.
    pub session_idle_ttl: Duration,
}

impl Default for NeroConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_retry_delay: default_retry_delay(),
            error_ring_capacity: 100,
            session_idle_ttl: Duration::from_secs(3600),
        }
    }
}

impl NeroConfig {
    /// Build an [`EndpointConfig`] seeded with this config's defaults.
    pub fn endpoint(&self, id: impl Into<String>, transport: Transport) -> EndpointConfig {
        EndpointConfig::new(id, transport)
            .with_timeout(self.default_timeout)
            .with_max_retries(self.default_max_retries)
            .with_retry_delay(self.default_retry_delay)
    }

    /// Parse an endpoint catalog (a JSON array of endpoint configs).
    ///
    /// Missing `timeout`, `max_retries` and `retry_delay` fields fall back to the
    /// crate defaults. Durations are expressed in milliseconds.
    ///
    /// ```rust
    /// use nero::config::{NeroConfig, Transport};
    ///
    /// let endpoints = NeroConfig::endpoints_from_json(r#"[
    ///     {"id": "frs", "transport": {"kind": "http", "url": "http://frs.local"}, "timeout": 5000},
    ///     {"id": "calc", "transport": {"kind": "in-process", "name": "calc"}}
    /// ]"#).unwrap();
    ///
    /// assert_eq!(endpoints.len(), 2);
    /// assert_eq!(endpoints[1].transport, Transport::InProcess { name: "calc".into() });
    /// ```
    pub fn endpoints_from_json(json: &str) -> Result<Vec<EndpointConfig>, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Serde helpers storing a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Same as [`duration_ms`] for optional durations.
pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
