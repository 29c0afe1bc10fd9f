//! Client and discussion event system.
//!
//! Provides a callback-based observability layer. Implement [`EventHandler`] to receive
//! real-time notifications about:
//!
//! - **Tool invocations**: each attempt, each failure, scheduled retries, and the
//!   final outcome of an [`EndpointClient::invoke`](crate::client::EndpointClient::invoke)
//! - **Discussion lifecycle**: every entry appended to the discussion audit trail
//!   (started, message sent, resolved, escalated, deferred, reopened)
//!
//! Both methods have default no-op implementations, so you only override what
//! you care about. The handler is shared as `Arc<dyn EventHandler>`.
//!
//! # Example
//!
//! ```rust,no_run
//! use nero::event::{ClientEvent, EventHandler};
//! use async_trait::async_trait;
//!
//! struct RetryLogger;
//!
//! #[async_trait]
//! impl EventHandler for RetryLogger {
//!     async fn on_client_event(&self, event: &ClientEvent) {
//!         if let ClientEvent::RetryScheduled { endpoint_id, attempt, delay, .. } = event {
//!             println!("{} retrying (attempt {}) in {:?}", endpoint_id, attempt, delay);
//!         }
//!     }
//! }
//! ```
//!
//! # Event Flow (one `invoke` that fails once, then succeeds)
//!
//! ```text
//! AttemptStarted { attempt: 0 }
//! AttemptFailed  { attempt: 0 }
//! RetryScheduled { attempt: 1, delay: retry_delay * 1 }
//! AttemptStarted { attempt: 1 }
//! InvocationCompleted { success: true, retry_count: 1 }
//! ```

use crate::nero::discussion::DiscussionLogEntry;
use crate::nero::tool_protocol::ErrorKind;
use async_trait::async_trait;
use std::time::Duration;

/// Events emitted by an [`EndpointClient`](crate::client::EndpointClient).
///
/// `attempt` is 0-based: attempt 0 is the initial call, attempt N is the Nth retry.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    AttemptStarted {
        endpoint_id: String,
        tool_name: String,
        attempt: u32,
    },

    AttemptFailed {
        endpoint_id: String,
        tool_name: String,
        attempt: u32,
        kind: ErrorKind,
        message: String,
    },

    /// Fired before the backoff sleep; `attempt` is the attempt about to run.
    RetryScheduled {
        endpoint_id: String,
        tool_name: String,
        attempt: u32,
        delay: Duration,
    },

    /// Fired exactly once per invocation.
    InvocationCompleted {
        endpoint_id: String,
        tool_name: String,
        success: bool,
        retry_count: u32,
        duration: Duration,
    },
}

/// Receives runtime events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_client_event(&self, _event: &ClientEvent) {}

    async fn on_discussion_event(&self, _entry: &DiscussionLogEntry) {}
}
