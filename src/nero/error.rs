//! Errors raised by session, discussion, and merge operations.
//!
//! Remote calls never raise (see [`ToolResponse`](crate::tool_protocol::ToolResponse));
//! misuse of local state ids does.

use crate::nero::discussion::DiscussionStatus;
use crate::nero::session::SessionStatus;
use crate::nero::tool_protocol::ClassifiedError;
use std::error::Error;
use std::fmt;

/// Result alias for collaboration-state operations.
pub type CollabResult<T> = Result<T, CollabError>;

#[derive(Debug, Clone, PartialEq)]
pub enum CollabError {
    SessionNotFound(String),
    /// The session is completed or expired and accepts no further changes.
    SessionClosed {
        session_id: String,
        status: SessionStatus,
    },
    InvalidSessionTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
    DiscussionNotFound {
        session_id: String,
        discussion_id: String,
    },
    ActionItemNotFound(String),
    /// The discussion is no longer active.
    DiscussionClosed {
        discussion_id: String,
        status: DiscussionStatus,
    },
    InvalidTransition {
        discussion_id: String,
        from: DiscussionStatus,
        to: DiscussionStatus,
    },
    /// A tool-backed message could not be produced.
    ToolInvocationFailed(ClassifiedError),
    Serialization(String),
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollabError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            CollabError::SessionClosed { session_id, status } => {
                write!(f, "Session {} is {}", session_id, status)
            }
            CollabError::InvalidSessionTransition {
                session_id,
                from,
                to,
            } => write!(
                f,
                "Session {} cannot move from {} to {}",
                session_id, from, to
            ),
            CollabError::DiscussionNotFound {
                session_id,
                discussion_id,
            } => write!(
                f,
                "Discussion not found: {} (session {})",
                discussion_id, session_id
            ),
            CollabError::ActionItemNotFound(id) => write!(f, "Action item not found: {}", id),
            CollabError::DiscussionClosed {
                discussion_id,
                status,
            } => write!(f, "Discussion {} is {}", discussion_id, status),
            CollabError::InvalidTransition {
                discussion_id,
                from,
                to,
            } => write!(
                f,
                "Discussion {} cannot move from {} to {}",
                discussion_id, from, to
            ),
            CollabError::ToolInvocationFailed(error) => {
                write!(f, "Tool invocation failed: {}", error)
            }
            CollabError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl Error for CollabError {}

impl From<serde_json::Error> for CollabError {
    fn from(error: serde_json::Error) -> Self {
        CollabError::Serialization(error.to_string())
    }
}

impl CollabError {
    /// True for the `*NotFound` variants.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CollabError::SessionNotFound(_)
                | CollabError::DiscussionNotFound { .. }
                | CollabError::ActionItemNotFound(_)
        )
    }
}
