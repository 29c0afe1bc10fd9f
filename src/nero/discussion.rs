//! Multi-turn discussions between agents inside a session.
//!
//! A [`Discussion`] lives inside exactly one [`Session`](crate::session::Session) and is
//! mutated only through the [`DiscussionEngine`], which goes through the
//! [`SessionStore`] so that appends to one session are serialised.
//!
//! # State machine
//!
//! ```text
//!            resolve_discussion
//!   Active ──────────────────────▶ Resolved
//!     │  escalate_discussion
//!     ├──────────────────────────▶ Escalated
//!     │  defer_discussion
//!     └──────────────────────────▶ Deferred
//!
//!   Resolved | Escalated | Deferred ──reopen_discussion──▶ Active
//! ```
//!
//! Only an `Active` discussion accepts messages or transitions. Anything else
//! (including a second `resolve_discussion`) fails with
//! [`CollabError::DiscussionClosed`]; reopening is always an explicit call.
//!
//! # Example
//!
//! ```rust
//! use nero::discussion::{DiscussionEngine, MessageKind, NewMessage, Resolution, ResolutionKind};
//! use nero::session::SessionStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SessionStore::new());
//! let engine = DiscussionEngine::new(store.clone());
//! let session = store.create_session(None, json!({}), None).await;
//!
//! let discussion = engine
//!     .start_discussion(&session.id, "Is the NOx limit exceeded?", vec!["monitor".into(), "permit".into()])
//!     .await?;
//! let question = engine
//!     .add_message(&session.id, &discussion.id, NewMessage::new("permit", MessageKind::Question, "Which unit?"))
//!     .await?;
//! engine
//!     .add_message(
//!         &session.id,
//!         &discussion.id,
//!         NewMessage::new("monitor", MessageKind::Response, "Boiler 2").in_response_to(&question.id),
//!     )
//!     .await?;
//!
//! let resolved = engine
//!     .resolve_discussion(
//!         &session.id,
//!         &discussion.id,
//!         Resolution::new(ResolutionKind::Consensus, "Boiler 2 exceeded", "File a deviation report"),
//!     )
//!     .await?;
//! assert!(resolved.completed_at.is_some());
//! # Ok(())
//! # }
//! ```

use crate::nero::config::option_duration_ms;
use crate::nero::error::{CollabError, CollabResult};
use crate::nero::event::EventHandler;
use crate::nero::registry::ClientRegistry;
use crate::nero::session::{Citation, Session, SessionStore};
use crate::nero::tool_protocol::ToolRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscussionStatus {
    Active,
    Resolved,
    Escalated,
    Deferred,
}

impl fmt::Display for DiscussionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DiscussionStatus::Active => "active",
            DiscussionStatus::Resolved => "resolved",
            DiscussionStatus::Escalated => "escalated",
            DiscussionStatus::Deferred => "deferred",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Statement,
    Question,
    Challenge,
    Response,
    Proposal,
    Agreement,
    Disagreement,
}

/// Records the tool call that produced a message's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallTrace {
    pub endpoint_id: String,
    pub tool_name: String,
    #[serde(with = "option_duration_ms", default)]
    pub duration: Option<Duration>,
}

/// One turn of a discussion. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub kind: MessageKind,
    pub content: String,
    /// Id of an earlier message; stored as given, not validated.
    pub in_response_to: Option<String>,
    pub citations: Vec<Citation>,
    pub artifact_refs: Vec<String>,
    pub confidence: Option<f32>,
    pub reasoning: Option<String>,
    pub tool_call: Option<ToolCallTrace>,
}

/// Input to [`DiscussionEngine::add_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub agent_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub in_response_to: Option<String>,
    pub citations: Vec<Citation>,
    pub artifact_refs: Vec<String>,
    pub confidence: Option<f32>,
    pub reasoning: Option<String>,
    pub tool_call: Option<ToolCallTrace>,
}

impl NewMessage {
    pub fn new(agent_id: impl Into<String>, kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind,
            content: content.into(),
            in_response_to: None,
            citations: Vec::new(),
            artifact_refs: Vec::new(),
            confidence: None,
            reasoning: None,
            tool_call: None,
        }
    }

    pub fn in_response_to(mut self, message_id: impl Into<String>) -> Self {
        self.in_response_to = Some(message_id.into());
        self
    }

    pub fn with_citation(mut self, citation: Citation) -> Self {
        self.citations.push(citation);
        self
    }

    pub fn with_artifact_ref(mut self, artifact_id: impl Into<String>) -> Self {
        self.artifact_refs.push(artifact_id.into());
        self
    }

    /// Confidence is clamped to `0.0..=1.0`.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_tool_call(mut self, trace: ToolCallTrace) -> Self {
        self.tool_call = Some(trace);
        self
    }

    fn into_message(self) -> DiscussionMessage {
        DiscussionMessage {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            agent_id: self.agent_id,
            kind: self.kind,
            content: self.content,
            in_response_to: self.in_response_to,
            citations: self.citations,
            artifact_refs: self.artifact_refs,
            confidence: self.confidence,
            reasoning: self.reasoning,
            tool_call: self.tool_call,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionKind {
    Consensus,
    Majority,
    ExpertDecision,
    HumanOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

/// Who an action item is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Assignee {
    Agent(String),
    Human,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub assignee: Assignee,
    pub priority: Priority,
    pub status: ActionStatus,
    pub due: Option<DateTime<Utc>>,
    pub blocked_reason: Option<String>,
}

impl ActionItem {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        assignee: Assignee,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            assignee,
            priority,
            status: ActionStatus::Pending,
            due: None,
            blocked_reason: None,
        }
    }

    pub fn with_due(mut self, due: DateTime<Utc>) -> Self {
        self.due = Some(due);
        self
    }
}

/// Terminal outcome of a discussion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub kind: ResolutionKind,
    pub summary: String,
    pub agreeing: Vec<String>,
    pub disagreeing: Vec<String>,
    pub decision: String,
    pub reasoning: String,
    pub artifacts_produced: Vec<String>,
    pub action_items: Vec<ActionItem>,
}

impl Resolution {
    pub fn new(kind: ResolutionKind, summary: impl Into<String>, decision: impl Into<String>) -> Self {
        Self {
            kind,
            summary: summary.into(),
            agreeing: Vec::new(),
            disagreeing: Vec::new(),
            decision: decision.into(),
            reasoning: String::new(),
            artifacts_produced: Vec::new(),
            action_items: Vec::new(),
        }
    }

    pub fn with_agreeing(mut self, agents: Vec<String>) -> Self {
        self.agreeing = agents;
        self
    }

    pub fn with_disagreeing(mut self, agents: Vec<String>) -> Self {
        self.disagreeing = agents;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_artifacts(mut self, artifact_ids: Vec<String>) -> Self {
        self.artifacts_produced = artifact_ids;
        self
    }

    pub fn with_action_item(mut self, item: ActionItem) -> Self {
        self.action_items.push(item);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discussion {
    pub id: String,
    pub topic: String,
    pub status: DiscussionStatus,
    pub participants: Vec<String>,
    /// Append order.
    pub messages: Vec<DiscussionMessage>,
    pub resolution: Option<Resolution>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Discussion {
    fn ensure_active(&self) -> CollabResult<()> {
        if self.status == DiscussionStatus::Active {
            Ok(())
        } else {
            Err(CollabError::DiscussionClosed {
                discussion_id: self.id.clone(),
                status: self.status,
            })
        }
    }

    pub fn message(&self, message_id: &str) -> Option<&DiscussionMessage> {
        self.messages.iter().find(|m| m.id == message_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscussionEventKind {
    Started,
    MessageSent,
    Resolved,
    Escalated,
    Deferred,
    Reopened,
}

/// One line of the discussion audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub discussion_id: String,
    pub event: DiscussionEventKind,
    pub agent_id: Option<String>,
    pub details: JsonValue,
}

/// Manages the lifecycle of discussions and keeps their audit trail.
pub struct DiscussionEngine {
    store: Arc<SessionStore>,
    log: Mutex<Vec<DiscussionLogEntry>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl DiscussionEngine {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            log: Mutex::new(Vec::new()),
            event_handler: None,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Open a discussion and add its participants to the session.
    pub async fn start_discussion(
        &self,
        session_id: &str,
        topic: impl Into<String>,
        participants: Vec<String>,
    ) -> CollabResult<Discussion> {
        let topic = topic.into();
        let (discussion, entry) = self
            .store
            .with_session(session_id, |session| {
                let mut unique: Vec<String> = Vec::with_capacity(participants.len());
                for agent in participants {
                    if !unique.contains(&agent) {
                        unique.push(agent);
                    }
                }
                session.participants.extend(unique.iter().cloned());

                let discussion = Discussion {
                    id: Uuid::new_v4().to_string(),
                    topic,
                    status: DiscussionStatus::Active,
                    participants: unique,
                    messages: Vec::new(),
                    resolution: None,
                    started_at: Utc::now(),
                    completed_at: None,
                };
                session.discussions.push(discussion.clone());

                let entry = self.record(
                    session,
                    &discussion.id,
                    DiscussionEventKind::Started,
                    None,
                    serde_json::json!({
                        "topic": discussion.topic,
                        "participants": discussion.participants,
                    }),
                );
                Ok((discussion, entry))
            })
            .await?;

        log::info!(
            "nero::discussion: started {} in {}: {}",
            discussion.id,
            session_id,
            discussion.topic
        );
        self.emit(&entry).await;
        Ok(discussion)
    }

    /// Append a message to an active discussion.
    pub async fn add_message(
        &self,
        session_id: &str,
        discussion_id: &str,
        message: NewMessage,
    ) -> CollabResult<DiscussionMessage> {
        let (stored, entry) = self
            .store
            .with_session(session_id, |session| {
                let discussion = session.discussion_mut(discussion_id)?;
                discussion.ensure_active()?;
                let stored = message.into_message();
                discussion.messages.push(stored.clone());

                let entry = self.record(
                    session,
                    discussion_id,
                    DiscussionEventKind::MessageSent,
                    Some(stored.agent_id.clone()),
                    serde_json::json!({
                        "messageId": stored.id,
                        "kind": stored.kind,
                        "inResponseTo": stored.in_response_to,
                    }),
                );
                Ok((stored, entry))
            })
            .await?;

        self.emit(&entry).await;
        Ok(stored)
    }

    /// Produce a message's content by invoking a tool through `registry`.
    ///
    /// The stored message records which endpoint and tool produced it and how long
    /// the call took. A failed invocation appends nothing.
    pub async fn add_tool_backed_message(
        &self,
        session_id: &str,
        discussion_id: &str,
        agent_id: impl Into<String>,
        kind: MessageKind,
        registry: &ClientRegistry,
        request: ToolRequest,
    ) -> CollabResult<DiscussionMessage> {
        // Fail fast before spending a remote call on a closed or unknown discussion
        self.store
            .read_session(session_id, |session| {
                session.ensure_open()?;
                session
                    .discussion(discussion_id)
                    .ok_or_else(|| CollabError::DiscussionNotFound {
                        session_id: session_id.to_string(),
                        discussion_id: discussion_id.to_string(),
                    })?
                    .ensure_active()
            })
            .await
            .unwrap_or_else(|| Err(CollabError::SessionNotFound(session_id.to_string())))?;

        let request = if request.session_id.is_none() {
            request.with_session(session_id)
        } else {
            request
        };
        let response = registry.invoke(&request).await;
        let payload = match &response.outcome {
            Ok(payload) => payload,
            Err(error) => return Err(CollabError::ToolInvocationFailed(error.clone())),
        };
        let content = match payload {
            JsonValue::String(text) => text.clone(),
            other => other.to_string(),
        };

        let message = NewMessage::new(agent_id, kind, content).with_tool_call(ToolCallTrace {
            endpoint_id: response.metadata.endpoint_id.clone(),
            tool_name: response.metadata.tool_name.clone(),
            duration: Some(response.metadata.duration),
        });
        self.add_message(session_id, discussion_id, message).await
    }

    /// Close an active discussion with `resolution`.
    pub async fn resolve_discussion(
        &self,
        session_id: &str,
        discussion_id: &str,
        resolution: Resolution,
    ) -> CollabResult<Discussion> {
        let details = serde_json::json!({
            "kind": resolution.kind,
            "decision": resolution.decision,
            "actionItems": resolution.action_items.len(),
        });
        self.close(
            session_id,
            discussion_id,
            DiscussionStatus::Resolved,
            DiscussionEventKind::Resolved,
            Some(resolution),
            details,
        )
        .await
    }

    pub async fn escalate_discussion(
        &self,
        session_id: &str,
        discussion_id: &str,
        reason: impl Into<String>,
    ) -> CollabResult<Discussion> {
        let details = serde_json::json!({ "reason": reason.into() });
        self.close(
            session_id,
            discussion_id,
            DiscussionStatus::Escalated,
            DiscussionEventKind::Escalated,
            None,
            details,
        )
        .await
    }

    pub async fn defer_discussion(
        &self,
        session_id: &str,
        discussion_id: &str,
        reason: impl Into<String>,
    ) -> CollabResult<Discussion> {
        let details = serde_json::json!({ "reason": reason.into() });
        self.close(
            session_id,
            discussion_id,
            DiscussionStatus::Deferred,
            DiscussionEventKind::Deferred,
            None,
            details,
        )
        .await
    }

    async fn close(
        &self,
        session_id: &str,
        discussion_id: &str,
        status: DiscussionStatus,
        event: DiscussionEventKind,
        resolution: Option<Resolution>,
        details: JsonValue,
    ) -> CollabResult<Discussion> {
        let (discussion, entry) = self
            .store
            .with_session(session_id, |session| {
                let discussion = session.discussion_mut(discussion_id)?;
                discussion.ensure_active()?;
                discussion.status = status;
                discussion.completed_at = Some(Utc::now());
                if resolution.is_some() {
                    discussion.resolution = resolution;
                }
                let snapshot = discussion.clone();
                let entry = self.record(session, discussion_id, event, None, details);
                Ok((snapshot, entry))
            })
            .await?;

        log::info!(
            "nero::discussion: {} in {} is now {}",
            discussion_id,
            session_id,
            status
        );
        self.emit(&entry).await;
        Ok(discussion)
    }

    /// Return a closed discussion to `Active`, dropping any resolution.
    pub async fn reopen_discussion(
        &self,
        session_id: &str,
        discussion_id: &str,
        reason: impl Into<String>,
    ) -> CollabResult<Discussion> {
        let reason = reason.into();
        let (discussion, entry) = self
            .store
            .with_session(session_id, |session| {
                let discussion = session.discussion_mut(discussion_id)?;
                if discussion.status == DiscussionStatus::Active {
                    return Err(CollabError::InvalidTransition {
                        discussion_id: discussion_id.to_string(),
                        from: DiscussionStatus::Active,
                        to: DiscussionStatus::Active,
                    });
                }
                let previous = discussion.status;
                discussion.status = DiscussionStatus::Active;
                discussion.resolution = None;
                discussion.completed_at = None;
                let snapshot = discussion.clone();
                let entry = self.record(
                    session,
                    discussion_id,
                    DiscussionEventKind::Reopened,
                    None,
                    serde_json::json!({ "from": previous, "reason": reason }),
                );
                Ok((snapshot, entry))
            })
            .await?;

        self.emit(&entry).await;
        Ok(discussion)
    }

    /// Update the status of an action item attached to a discussion's resolution.
    pub async fn update_action_item(
        &self,
        session_id: &str,
        discussion_id: &str,
        item_id: &str,
        status: ActionStatus,
        blocked_reason: Option<String>,
    ) -> CollabResult<ActionItem> {
        self.store
            .with_session(session_id, |session| {
                let item = session
                    .discussion_mut(discussion_id)?
                    .resolution
                    .as_mut()
                    .and_then(|r| r.action_items.iter_mut().find(|i| i.id == item_id))
                    .ok_or_else(|| CollabError::ActionItemNotFound(item_id.to_string()))?;
                item.status = status;
                item.blocked_reason = if status == ActionStatus::Blocked {
                    blocked_reason
                } else {
                    None
                };
                Ok(item.clone())
            })
            .await
    }

    pub async fn get_discussion(&self, session_id: &str, discussion_id: &str) -> Option<Discussion> {
        self.store
            .read_session(session_id, |s| s.discussion(discussion_id).cloned())
            .await
            .flatten()
    }

    /// Discussions of a session in start order; empty for an unknown session.
    pub async fn list_discussions(&self, session_id: &str) -> Vec<Discussion> {
        self.store
            .read_session(session_id, |s| s.discussions.clone())
            .await
            .unwrap_or_default()
    }

    /// Chronological audit trail, optionally restricted to one session.
    pub fn discussion_logs(&self, session_id: Option<&str>) -> Vec<DiscussionLogEntry> {
        let mut entries: Vec<DiscussionLogEntry> = lock(&self.log)
            .iter()
            .filter(|e| session_id.map_or(true, |id| e.session_id == id))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// Drop every audit entry of `session_id`. Returns how many were removed.
    pub fn prune_logs(&self, session_id: &str) -> usize {
        let mut log = lock(&self.log);
        let before = log.len();
        log.retain(|e| e.session_id != session_id);
        before - log.len()
    }

    /// Purge closed sessions from the store along with their audit trail.
    pub async fn purge_closed_sessions(&self, older_than: Duration) -> Vec<String> {
        let purged = self.store.purge_closed(older_than).await;
        if !purged.is_empty() {
            let mut log = lock(&self.log);
            log.retain(|e| !purged.contains(&e.session_id));
        }
        purged
    }

    // Called with the session lock held so log order matches store order.
    fn record(
        &self,
        session: &Session,
        discussion_id: &str,
        event: DiscussionEventKind,
        agent_id: Option<String>,
        details: JsonValue,
    ) -> DiscussionLogEntry {
        let entry = DiscussionLogEntry {
            timestamp: Utc::now(),
            session_id: session.id.clone(),
            discussion_id: discussion_id.to_string(),
            event,
            agent_id,
            details,
        };
        lock(&self.log).push(entry.clone());
        entry
    }

    async fn emit(&self, entry: &DiscussionLogEntry) {
        if let Some(handler) = &self.event_handler {
            handler.on_discussion_event(entry).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
