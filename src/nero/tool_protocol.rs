//! Tool Protocol Abstraction Layer
//!
//! This module defines the contract between the runtime and an out-of-process tool
//! endpoint, plus the value types that flow through every tool invocation.
//!
//! # Architecture
//!
//! ```text
//! caller → ClientRegistry → EndpointClient (retry, metrics) → ToolProtocol (trait)
//!                                                               └─ [in-process | HTTP | socket]
//! ```
//!
//! The endpoint itself is a black box: it may succeed, fail, or never answer. The
//! runtime only relies on a call that returns a payload or an error; timeouts are
//! enforced by the client, and idempotency is not assumed (a retry may re-run side
//! effects on the endpoint).
//!
//! # Example
//!
//! ```rust
//! use nero::tool_protocol::{ErrorKind, ToolRequest, classify_error_message};
//! use serde_json::json;
//!
//! let request = ToolRequest::new("frs", "lookup_facility")
//!     .with_argument("registry_id", json!("110000350174"))
//!     .with_agent("permit-agent");
//!
//! assert_eq!(request.arguments["registry_id"], "110000350174");
//! assert_eq!(classify_error_message("connection refused"), ErrorKind::Connection);
//! ```

use crate::nero::config::{duration_ms, option_duration_ms};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Argument bag passed to a tool.
pub type ToolArguments = serde_json::Map<String, JsonValue>;

/// Trait implemented by every endpoint transport.
#[async_trait]
pub trait ToolProtocol: Send + Sync {
    /// Invoke `tool_name` with the given arguments, returning the raw result payload.
    async fn call(
        &self,
        tool_name: &str,
        arguments: &ToolArguments,
    ) -> Result<JsonValue, Box<dyn Error + Send + Sync>>;

    /// Protocol identifier (e.g. "in-process", "http", "socket").
    fn protocol_name(&self) -> &str;
}

/// Transport-level failures raised by the built-in protocols.
///
/// The `Display` text of each variant carries the keyword the default
/// [`KeywordClassifier`] looks for, so these errors classify predictably.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Requested tool is not exposed by the endpoint.
    NotFound(String),
    /// Tool ran and reported an application level failure.
    ExecutionFailed(String),
    /// The endpoint rejected our credentials.
    Unauthorized(String),
    /// The endpoint reported a state conflict.
    Conflict(String),
    /// The endpoint could not be reached.
    Connection(String),
    /// Malformed response or other protocol error.
    ProtocolError(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {}", name),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool execution failed: {}", msg),
            ToolError::Unauthorized(msg) => write!(f, "Authentication failed: {}", msg),
            ToolError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ToolError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ToolError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// Classified failure kinds surfaced by clients and the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    Authentication,
    ToolError,
    Conflict,
    ServerError,
    EndpointNotFound,
    Cancelled,
}

impl ErrorKind {
    /// Stable string code, e.g. `"endpoint-not-found"`.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::ToolError => "tool-error",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ServerError => "server-error",
            ErrorKind::EndpointNotFound => "endpoint-not-found",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorKind::Authentication | ErrorKind::EndpointNotFound | ErrorKind::Cancelled
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A failure tagged with an [`ErrorKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    /// Debug rendering of the underlying cause.
    pub cause: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: cause.into(),
        }
    }

    /// Shorthand for the stable error code of this failure.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub(crate) fn from_source(kind: ErrorKind, error: &(dyn Error + Send + Sync + 'static)) -> Self {
        Self::new(kind, error.to_string(), format!("{:?}", error))
    }

    pub(crate) fn endpoint_not_found(endpoint_id: &str) -> Self {
        Self::new(
            ErrorKind::EndpointNotFound,
            format!("No client registered for endpoint '{}'", endpoint_id),
            "registry lookup",
        )
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl Error for ClassifiedError {}

/// Maps a raw transport failure onto an [`ErrorKind`].
///
/// Swap the default [`KeywordClassifier`] for a protocol-aware implementation
/// without touching the retry loop.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &(dyn Error + Send + Sync + 'static)) -> ErrorKind;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&(dyn Error + Send + Sync + 'static)) -> ErrorKind + Send + Sync,
{
    fn classify(&self, error: &(dyn Error + Send + Sync + 'static)) -> ErrorKind {
        self(error)
    }
}

/// Best-effort classifier that inspects the error message for keyword hints.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl ErrorClassifier for KeywordClassifier {
    fn classify(&self, error: &(dyn Error + Send + Sync + 'static)) -> ErrorKind {
        classify_error_message(&error.to_string())
    }
}

/// Keyword classification of an error message.
///
/// This is approximate: it matches substrings (`timeout`, `connection`, `auth`,
/// `conflict`, `tool`) in that order and falls back to [`ErrorKind::ServerError`].
pub fn classify_error_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if lower.contains("connection") || lower.contains("connect") {
        ErrorKind::Connection
    } else if lower.contains("auth") || lower.contains("forbidden") {
        ErrorKind::Authentication
    } else if lower.contains("conflict") {
        ErrorKind::Conflict
    } else if lower.contains("tool") {
        ErrorKind::ToolError
    } else {
        ErrorKind::ServerError
    }
}

/// An immutable request to run one tool on one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub endpoint_id: String,
    pub tool_name: String,
    pub arguments: ToolArguments,
    /// Overrides the endpoint's configured per-attempt timeout.
    #[serde(with = "option_duration_ms", default)]
    pub timeout: Option<Duration>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
}

impl ToolRequest {
    pub fn new(endpoint_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            tool_name: tool_name.into(),
            arguments: ToolArguments::new(),
            timeout: None,
            session_id: None,
            agent_id: None,
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn with_arguments(mut self, arguments: ToolArguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// Metadata attached to every [`ToolResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub endpoint_id: String,
    pub tool_name: String,
    /// Wall time of the whole invocation, backoff included.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    /// Retries spent after the first attempt.
    pub retry_count: u32,
}

/// Outcome of one tool invocation. Produced once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub outcome: Result<JsonValue, ClassifiedError>,
    pub metadata: ResponseMetadata,
}

impl ToolResponse {
    pub(crate) fn success(payload: JsonValue, metadata: ResponseMetadata) -> Self {
        Self {
            outcome: Ok(payload),
            metadata,
        }
    }

    pub(crate) fn failure(error: ClassifiedError, metadata: ResponseMetadata) -> Self {
        Self {
            outcome: Err(error),
            metadata,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn payload(&self) -> Option<&JsonValue> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ClassifiedError> {
        self.outcome.as_ref().err()
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata.retry_count
    }
}
