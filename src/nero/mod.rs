// src/nero/mod.rs

pub mod client;
pub mod config;
pub mod context_merger;
pub mod discussion;
pub mod error;
pub mod event;
pub mod registry;
pub mod session;
pub mod tool_protocol;
pub mod tool_protocols;

// Expose the two entry points as nero::nero::ClientRegistry and nero::nero::SessionStore
pub use registry::ClientRegistry;
pub use session::SessionStore;
