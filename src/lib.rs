//! # NERO
//!
//! NERO is the collaboration runtime behind a team of tool-using agents. It sits between
//! the agents and the external tool endpoints they call, and keeps the shared state of a
//! collaboration run: what was produced, what was discussed, and what was agreed.
//!
//! The crate provides layered building blocks:
//!
//! * **Tool invocation**: [`EndpointClient`] calls one tool on one endpoint with
//!   per-call timeouts, linear-backoff retries, classified errors, metrics, and a
//!   bounded ring of recent failures.
//! * **Routing**: [`ClientRegistry`] owns one client per endpoint, routes requests by
//!   endpoint id, and runs health checks concurrently.
//! * **Collaboration state**: [`SessionStore`] owns sessions, their shared context, and
//!   their versioned artifacts, serialising writes per session.
//! * **Discussions**: [`DiscussionEngine`] runs multi-turn exchanges between agents and
//!   closes them with a resolution and action items.
//! * **Context merging**: [`ContextMerger`] folds context fragments from several agents
//!   into one, recording conflicts instead of dropping data.
//!
//! ## Components
//!
//! ```text
//!   caller ──▶ ClientRegistry ──▶ EndpointClient ──▶ ToolProtocol (in-process / http / socket)
//!                                    │ retries, metrics, error ring
//!                                    ▼
//!                               ToolResponse { Ok(payload) | Err(ClassifiedError) }
//!
//!   caller ──▶ SessionStore ◀── DiscussionEngine
//!                   ▲
//!                   └──── MergedContext ◀── ContextMerger
//! ```
//!
//! ## Getting Started
//!
//! ```rust
//! use nero::tool_protocol::ToolRequest;
//! use nero::tool_protocols::LocalToolProtocol;
//! use nero::{ClientRegistry, EndpointConfig, SessionStore, Transport};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     nero::init_logger();
//!
//!     let local = Arc::new(LocalToolProtocol::new());
//!     local
//!         .register_tool("lookup_permit", Arc::new(|_args| Ok(json!({"permit": "P-17"}))))
//!         .await;
//!
//!     let registry = ClientRegistry::new();
//!     registry
//!         .register(
//!             EndpointConfig::new("permits", Transport::InProcess { name: "permits".into() }),
//!             local,
//!         )
//!         .await;
//!
//!     let response = registry.invoke(&ToolRequest::new("permits", "lookup_permit")).await;
//!     assert_eq!(response.payload(), Some(&json!({"permit": "P-17"})));
//!
//!     let store = SessionStore::new();
//!     let session = store.create_session(None, json!({"phase": "draft"}), None).await;
//!     assert_eq!(session.context["phase"], json!("draft"));
//!     Ok(())
//! }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Every module logs through the `log` facade with a `nero::<module>:` prefix, so
/// `RUST_LOG=nero=debug` shows retries, merges, and discussion transitions.
///
/// ```rust
/// nero::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `nero` module.
pub mod nero;

// Re-exporting key items for easier external access.
pub use nero::client;
pub use nero::client::{EndpointClient, EndpointMetrics, ErrorRecord};
pub use nero::config;
pub use nero::config::{EndpointConfig, NeroConfig, Transport};
pub use nero::context_merger;
pub use nero::context_merger::{
    ContextContribution, ContextMerger, ExpertPreference, MergeStrategy, MergedContext,
};
pub use nero::discussion;
pub use nero::discussion::{DiscussionEngine, MessageKind, NewMessage, Resolution};
pub use nero::error;
pub use nero::error::{CollabError, CollabResult};
pub use nero::event;
pub use nero::event::{ClientEvent, EventHandler};
pub use nero::registry;
pub use nero::registry::ClientRegistry;
pub use nero::session;
pub use nero::session::{NewArtifact, Session, SessionStore};
pub use nero::tool_protocol;
pub use nero::tool_protocol::{ClassifiedError, ErrorKind, ToolRequest, ToolResponse};
pub use nero::tool_protocols;
