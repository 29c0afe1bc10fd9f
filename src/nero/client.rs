//! Retrying tool client for a single endpoint.
//!
//! [`EndpointClient`] owns everything that is per-endpoint: the transport, the retry
//! policy from its [`EndpointConfig`], latency and error metrics, and a bounded ring
//! of recent failures.
//!
//! # Retry semantics
//!
//! An invocation makes one initial attempt plus up to `max_retries` retries. After a
//! failed attempt `n` (0-based) the client sleeps `retry_delay * (n + 1)` before the
//! next one. [`ResponseMetadata::retry_count`](crate::tool_protocol::ResponseMetadata)
//! counts retries only, so an endpoint that always fails yields
//! `retry_count == max_retries`. Metrics count one request per invocation regardless
//! of how many attempts it took.
//!
//! # Example
//!
//! ```rust,no_run
//! use nero::client::EndpointClient;
//! use nero::config::{EndpointConfig, Transport};
//! use nero::tool_protocol::ToolRequest;
//! use nero::tool_protocols::HttpToolProtocol;
//! use std::sync::Arc;
//!
//! # async {
//! let config = EndpointConfig::new("echo", Transport::Http { url: "http://localhost:8080".into() });
//! let client = EndpointClient::new(config, Arc::new(HttpToolProtocol::new("http://localhost:8080")));
//!
//! let response = client.invoke(&ToolRequest::new("echo", "get_facility")).await;
//! match &response.outcome {
//!     Ok(payload) => println!("facility: {}", payload),
//!     Err(error) => println!("failed after {} retries: {}", response.retry_count(), error),
//! }
//! println!("error rate: {:.2}", client.metrics().error_rate);
//! # };
//! ```

use crate::nero::config::{duration_ms, EndpointConfig};
use crate::nero::event::{ClientEvent, EventHandler};
use crate::nero::tool_protocol::{
    ClassifiedError, ErrorClassifier, ErrorKind, KeywordClassifier, ResponseMetadata,
    ToolProtocol, ToolRequest, ToolResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Reserved tool used by [`EndpointClient::health_check`].
pub const PING_TOOL: &str = "ping";

/// Default capacity of the recent-error ring.
pub const DEFAULT_ERROR_CAPACITY: usize = 100;

/// Per-endpoint counters, returned by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// `failed_requests / total_requests`, 0 before the first call.
    pub error_rate: f64,
    /// Running mean over every invocation, successful or not.
    #[serde(with = "duration_ms")]
    pub average_latency: Duration,
    /// Successful invocations per tool name.
    pub tool_usage: HashMap<String, u64>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl EndpointMetrics {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            error_rate: 0.0,
            average_latency: Duration::ZERO,
            tool_usage: HashMap::new(),
            window_start: now,
            window_end: now,
        }
    }

    fn record_success(&mut self, tool_name: &str, latency: Duration) {
        self.successful_requests += 1;
        *self.tool_usage.entry(tool_name.to_string()).or_insert(0) += 1;
        self.record(latency);
    }

    fn record_failure(&mut self, latency: Duration) {
        self.failed_requests += 1;
        self.record(latency);
    }

    fn record(&mut self, latency: Duration) {
        self.total_requests += 1;
        let n = self.total_requests as f64;
        let mean = self.average_latency.as_secs_f64();
        self.average_latency = Duration::from_secs_f64(mean + (latency.as_secs_f64() - mean) / n);
        self.error_rate = self.failed_requests as f64 / n;
        self.window_end = Utc::now();
    }
}

/// One entry of the recent-error ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub endpoint_id: String,
    pub tool_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
    pub retries_attempted: u32,
}

/// Executes tool requests against one endpoint with bounded retries.
pub struct EndpointClient {
    config: EndpointConfig,
    protocol: Arc<dyn ToolProtocol>,
    classifier: Arc<dyn ErrorClassifier>,
    metrics: Mutex<EndpointMetrics>,
    errors: Mutex<VecDeque<ErrorRecord>>,
    error_capacity: usize,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl EndpointClient {
    pub fn new(config: EndpointConfig, protocol: Arc<dyn ToolProtocol>) -> Self {
        Self {
            config,
            protocol,
            classifier: Arc::new(KeywordClassifier),
            metrics: Mutex::new(EndpointMetrics::new()),
            errors: Mutex::new(VecDeque::with_capacity(DEFAULT_ERROR_CAPACITY)),
            error_capacity: DEFAULT_ERROR_CAPACITY,
            event_handler: None,
        }
    }

    /// Replace the default keyword classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Keep at most `capacity` errors (minimum 1).
    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity.max(1);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn endpoint_id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Run `request`, retrying failed attempts with linear backoff.
    ///
    /// Never fails: the outcome, including a classified error, is in the response.
    pub async fn invoke(&self, request: &ToolRequest) -> ToolResponse {
        self.invoke_until(request, std::future::pending()).await
    }

    /// Like [`invoke`](Self::invoke), but gives up as soon as `cancel` completes,
    /// whether an attempt or a backoff sleep is in flight. A cancelled invocation
    /// returns an [`ErrorKind::Cancelled`] failure.
    pub async fn invoke_cancellable<F>(&self, request: &ToolRequest, cancel: F) -> ToolResponse
    where
        F: Future<Output = ()> + Send,
    {
        self.invoke_until(request, cancel).await
    }

    async fn invoke_until<F>(&self, request: &ToolRequest, cancel: F) -> ToolResponse
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(cancel);
        let started = Instant::now();
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let mut attempt: u32 = 0;

        loop {
            self.emit(ClientEvent::AttemptStarted {
                endpoint_id: self.config.id.clone(),
                tool_name: request.tool_name.clone(),
                attempt,
            })
            .await;

            let outcome = tokio::select! {
                biased;
                _ = &mut cancel => None,
                result = tokio::time::timeout(
                    timeout,
                    self.protocol.call(&request.tool_name, &request.arguments),
                ) => Some(result),
            };

            let error = match outcome {
                None => return self.finish_cancelled(request, started, attempt).await,
                Some(Ok(Ok(payload))) => {
                    return self.finish_success(request, payload, started, attempt).await;
                }
                Some(Ok(Err(err))) => {
                    let kind = self.classifier.classify(err.as_ref());
                    ClassifiedError::from_source(kind, err.as_ref())
                }
                Some(Err(elapsed)) => ClassifiedError::new(
                    ErrorKind::Timeout,
                    format!(
                        "{} on '{}' exceeded timeout of {:?}",
                        request.tool_name, self.config.id, timeout
                    ),
                    format!("{:?}", elapsed),
                ),
            };

            log::warn!(
                "nero::client: {}::{} attempt {} failed: {}",
                self.config.id,
                request.tool_name,
                attempt,
                error
            );
            self.emit(ClientEvent::AttemptFailed {
                endpoint_id: self.config.id.clone(),
                tool_name: request.tool_name.clone(),
                attempt,
                kind: error.kind,
                message: error.message.clone(),
            })
            .await;

            if attempt >= self.config.max_retries || !error.kind.is_retryable() {
                return self.finish_failure(request, error, started, attempt).await;
            }

            let delay = backoff_delay(self.config.retry_delay, attempt);
            attempt += 1;
            self.emit(ClientEvent::RetryScheduled {
                endpoint_id: self.config.id.clone(),
                tool_name: request.tool_name.clone(),
                attempt,
                delay,
            })
            .await;

            let cancelled = tokio::select! {
                biased;
                _ = &mut cancel => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                return self.finish_cancelled(request, started, attempt - 1).await;
            }
        }
    }

    async fn finish_success(
        &self,
        request: &ToolRequest,
        payload: JsonValue,
        started: Instant,
        retries: u32,
    ) -> ToolResponse {
        let duration = started.elapsed();
        lock(&self.metrics).record_success(&request.tool_name, duration);
        log::debug!(
            "nero::client: {}::{} succeeded in {:?} after {} retries",
            self.config.id,
            request.tool_name,
            duration,
            retries
        );
        self.emit_completed(request, true, retries, duration).await;
        ToolResponse::success(payload, self.response_metadata(request, duration, retries))
    }

    async fn finish_failure(
        &self,
        request: &ToolRequest,
        error: ClassifiedError,
        started: Instant,
        retries: u32,
    ) -> ToolResponse {
        let duration = started.elapsed();
        lock(&self.metrics).record_failure(duration);
        self.push_error(ErrorRecord {
            kind: error.kind,
            endpoint_id: self.config.id.clone(),
            tool_name: request.tool_name.clone(),
            message: error.message.clone(),
            timestamp: Utc::now(),
            retryable: error.kind.is_retryable(),
            retries_attempted: retries,
        });
        log::error!(
            "nero::client: {}::{} failed after {} retries: {}",
            self.config.id,
            request.tool_name,
            retries,
            error
        );
        self.emit_completed(request, false, retries, duration).await;
        ToolResponse::failure(error, self.response_metadata(request, duration, retries))
    }

    async fn finish_cancelled(
        &self,
        request: &ToolRequest,
        started: Instant,
        retries: u32,
    ) -> ToolResponse {
        let error = ClassifiedError::new(
            ErrorKind::Cancelled,
            format!("{} on '{}' was cancelled", request.tool_name, self.config.id),
            "caller cancelled",
        );
        self.finish_failure(request, error, started, retries).await
    }

    fn response_metadata(
        &self,
        request: &ToolRequest,
        duration: Duration,
        retry_count: u32,
    ) -> ResponseMetadata {
        ResponseMetadata {
            endpoint_id: self.config.id.clone(),
            tool_name: request.tool_name.clone(),
            duration,
            timestamp: Utc::now(),
            retry_count,
        }
    }

    fn push_error(&self, record: ErrorRecord) {
        let mut errors = lock(&self.errors);
        while errors.len() >= self.error_capacity {
            errors.pop_front();
        }
        errors.push_back(record);
    }

    async fn emit(&self, event: ClientEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_client_event(&event).await;
        }
    }

    async fn emit_completed(
        &self,
        request: &ToolRequest,
        success: bool,
        retry_count: u32,
        duration: Duration,
    ) {
        self.emit(ClientEvent::InvocationCompleted {
            endpoint_id: self.config.id.clone(),
            tool_name: request.tool_name.clone(),
            success,
            retry_count,
            duration,
        })
        .await;
    }

    /// Snapshot of the current counters.
    pub fn metrics(&self) -> EndpointMetrics {
        lock(&self.metrics).clone()
    }

    /// Start a fresh observation window.
    pub fn reset_metrics(&self) {
        *lock(&self.metrics) = EndpointMetrics::new();
    }

    /// Up to `limit` most recent errors, oldest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        let errors = lock(&self.errors);
        let skip = errors.len().saturating_sub(limit);
        errors.iter().skip(skip).cloned().collect()
    }

    pub fn clear_errors(&self) {
        lock(&self.errors).clear();
    }

    /// Call the reserved `ping` tool through the normal retry path.
    pub async fn health_check(&self) -> bool {
        let request = ToolRequest::new(self.config.id.clone(), PING_TOOL);
        let healthy = self.invoke(&request).await.is_success();
        if !healthy {
            log::warn!("nero::client: health check failed for '{}'", self.config.id);
        }
        healthy
    }
}

// Guards are never held across an await, so a poisoned lock only means another
// thread panicked mid-update; the counters are still usable.
/// Linear backoff after failed attempt `attempt`, saturating at `Duration::MAX`.
fn backoff_delay(retry_delay: Duration, attempt: u32) -> Duration {
    retry_delay
        .checked_mul(attempt.saturating_add(1))
        .unwrap_or(Duration::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_running_average() {
        let mut metrics = EndpointMetrics::new();
        metrics.record_success("a", Duration::from_millis(10));
        metrics.record_failure(Duration::from_millis(30));
        metrics.record_success("a", Duration::from_millis(20));

        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.tool_usage["a"], 2);
        assert!((metrics.error_rate - 1.0 / 3.0).abs() < f64::EPSILON);
        let avg = metrics.average_latency.as_secs_f64() * 1000.0;
        assert!((avg - 20.0).abs() < 0.001, "average was {}", avg);
        assert!(metrics.window_end >= metrics.window_start);
    }

    #[test]
    fn test_backoff_delay_saturates() {
        let step = Duration::from_millis(250);
        assert_eq!(backoff_delay(step, 0), step);
        assert_eq!(backoff_delay(step, 3), Duration::from_secs(1));
        assert_eq!(backoff_delay(Duration::MAX, 1), Duration::MAX);
        assert_eq!(backoff_delay(Duration::from_secs(u64::MAX / 2), u32::MAX), Duration::MAX);
    }
}
