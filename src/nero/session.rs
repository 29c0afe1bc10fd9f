//! Collaboration sessions and their artifacts.
//!
//! A [`Session`] is the unit of collaboration state for one workflow run: a shared
//! context blob, a versioned artifact collection, the discussions held so far, and
//! the set of participating agents. The [`SessionStore`] is the only writer; every
//! read hands back an owned snapshot.
//!
//! # Concurrency
//!
//! ```text
//! SessionStore
//!   └─ RwLock<HashMap<id, Arc<Mutex<Session>>>>
//!        ├─ "s-1" → Mutex<Session>   mutations of s-1 are serialised here
//!        └─ "s-2" → Mutex<Session>   ...independently of s-2
//! ```
//!
//! # Example
//!
//! ```rust
//! use nero::session::{NewArtifact, SessionStore};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SessionStore::new();
//! let session = store
//!     .create_session(Some("wf-permit-review".into()), json!({"phase": "draft"}), None)
//!     .await;
//!
//! let draft = store
//!     .store_artifact(
//!         &session.id,
//!         NewArtifact::new("report", "Compliance summary", json!("v1"), "report-agent")
//!             .with_id("summary"),
//!     )
//!     .await?;
//! assert_eq!(draft.version, 1);
//!
//! let revised = store
//!     .store_artifact(
//!         &session.id,
//!         NewArtifact::new("report", "Compliance summary", json!("v2"), "report-agent")
//!             .with_id("summary"),
//!     )
//!     .await?;
//! assert_eq!(revised.version, 2);
//! assert_eq!(store.list_artifacts(&session.id).await.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::nero::config::NeroConfig;
use crate::nero::context_merger::MergedContext;
use crate::nero::discussion::Discussion;
use crate::nero::error::{CollabError, CollabResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Free-form key/value blob.
pub type ContextMap = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Expired,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
        };
        f.write_str(label)
    }
}

impl SessionStatus {
    /// Completed and expired sessions accept no further changes.
    pub fn is_closed(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Expired)
    }

    /// Active and paused sessions move between each other or close; closed ones stay closed.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Active, SessionStatus::Paused)
            | (SessionStatus::Paused, SessionStatus::Active) => true,
            (SessionStatus::Active | SessionStatus::Paused, to) => to.is_closed(),
            _ => false,
        }
    }
}

/// A source backing an artifact or message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub reference: String,
    pub excerpt: Option<String>,
}

impl Citation {
    pub fn new(source: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reference: reference.into(),
            excerpt: None,
        }
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = Some(excerpt.into());
        self
    }
}

/// A versioned, session-scoped output produced by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub artifact_type: String,
    pub name: String,
    pub content: JsonValue,
    pub produced_by: String,
    pub produced_at: DateTime<Utc>,
    /// Starts at 1 and increments on every update of the same id.
    pub version: u32,
    pub citations: Vec<Citation>,
    /// Ids of artifacts this one was derived from.
    pub dependencies: Vec<String>,
}

/// Input to [`SessionStore::store_artifact`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub id: Option<String>,
    pub artifact_type: String,
    pub name: String,
    pub content: JsonValue,
    pub produced_by: String,
    pub citations: Option<Vec<Citation>>,
    pub dependencies: Option<Vec<String>>,
}

impl NewArtifact {
    pub fn new(
        artifact_type: impl Into<String>,
        name: impl Into<String>,
        content: JsonValue,
        produced_by: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            artifact_type: artifact_type.into(),
            name: name.into(),
            content,
            produced_by: produced_by.into(),
            citations: None,
            dependencies: None,
        }
    }

    /// Target an existing artifact id (or pick the id of a new one).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = Some(citations);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }
}

/// Workflow descriptor supplied by the external workflow starter.
///
/// Only its id and participant list are used; step definitions are not interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDescriptor {
    pub id: String,
    pub name: String,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub workflow_id: Option<String>,
    pub status: SessionStatus,
    pub context: ContextMap,
    /// Insertion ordered; ids are unique.
    pub artifacts: Vec<Artifact>,
    pub discussions: Vec<Discussion>,
    pub participants: BTreeSet<String>,
    pub metadata: ContextMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(workflow_id: Option<String>, context: ContextMap, metadata: ContextMap) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id,
            status: SessionStatus::Active,
            context,
            artifacts: Vec::new(),
            discussions: Vec::new(),
            participants: BTreeSet::new(),
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn artifact(&self, artifact_id: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.id == artifact_id)
    }

    pub fn discussion(&self, discussion_id: &str) -> Option<&Discussion> {
        self.discussions.iter().find(|d| d.id == discussion_id)
    }

    pub(crate) fn discussion_mut(&mut self, discussion_id: &str) -> CollabResult<&mut Discussion> {
        let session_id = self.id.clone();
        self.discussions
            .iter_mut()
            .find(|d| d.id == discussion_id)
            .ok_or_else(|| CollabError::DiscussionNotFound {
                session_id,
                discussion_id: discussion_id.to_string(),
            })
    }

    pub(crate) fn ensure_open(&self) -> CollabResult<()> {
        if self.status.is_closed() {
            return Err(CollabError::SessionClosed {
                session_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Owns every session and serialises mutations per session id.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create an active session.
    ///
    /// `initial_context` is copied in if it is a JSON object; any other value
    /// yields an empty context.
    pub async fn create_session(
        &self,
        workflow_id: Option<String>,
        initial_context: JsonValue,
        metadata: Option<ContextMap>,
    ) -> Session {
        let context = match initial_context {
            JsonValue::Object(map) => map,
            _ => ContextMap::new(),
        };
        let session = Session::new(workflow_id, context, metadata.unwrap_or_default());
        self.insert(session).await
    }

    /// Create a session bound to a workflow, seeding its participants.
    pub async fn create_session_for_workflow(
        &self,
        workflow: &WorkflowDescriptor,
        initial_context: JsonValue,
    ) -> Session {
        let mut metadata = ContextMap::new();
        metadata.insert("workflowName".to_string(), JsonValue::from(workflow.name.clone()));
        let context = match initial_context {
            JsonValue::Object(map) => map,
            _ => ContextMap::new(),
        };
        let mut session = Session::new(Some(workflow.id.clone()), context, metadata);
        session.participants.extend(workflow.participants.iter().cloned());
        self.insert(session).await
    }

    async fn insert(&self, session: Session) -> Session {
        log::info!(
            "nero::session: created session {} (workflow {:?})",
            session.id,
            session.workflow_id
        );
        let snapshot = session.clone();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session)));
        snapshot
    }

    async fn handle(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn require(&self, session_id: &str) -> CollabResult<Arc<Mutex<Session>>> {
        self.handle(session_id)
            .await
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))
    }

    /// Apply `mutate` under the session's lock and bump `updated_at` on success.
    ///
    /// Closed sessions are rejected before `mutate` runs.
    pub(crate) async fn with_session<R, F>(&self, session_id: &str, mutate: F) -> CollabResult<R>
    where
        F: FnOnce(&mut Session) -> CollabResult<R>,
    {
        let handle = self.require(session_id).await?;
        let mut session = handle.lock().await;
        session.ensure_open()?;
        let result = mutate(&mut *session)?;
        session.touch();
        Ok(result)
    }

    /// Read from a session under its lock.
    pub(crate) async fn read_session<R, F>(&self, session_id: &str, read: F) -> Option<R>
    where
        F: FnOnce(&Session) -> R,
    {
        let handle = self.handle(session_id).await?;
        let session = handle.lock().await;
        Some(read(&*session))
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.read_session(session_id, Session::clone).await
    }

    /// Snapshots of every session, oldest first.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let handles: Vec<Arc<Mutex<Session>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            sessions.push(handle.lock().await.clone());
        }
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Shallow-merge `patch` into the session context.
    pub async fn update_context(&self, session_id: &str, patch: ContextMap) -> CollabResult<()> {
        self.with_session(session_id, |session| {
            for (key, value) in patch {
                session.context.insert(key, value);
            }
            Ok(())
        })
        .await
    }

    /// Replace the session context with a merge result and record its contributors
    /// as participants.
    pub async fn apply_merged_context(
        &self,
        session_id: &str,
        merged: &MergedContext,
    ) -> CollabResult<()> {
        self.with_session(session_id, |session| {
            session.context = merged.context.clone();
            session
                .participants
                .extend(merged.sources.iter().map(|s| s.agent_id.clone()));
            Ok(())
        })
        .await
    }

    /// Create an artifact, or bump the version of an existing one with the same id.
    pub async fn store_artifact(
        &self,
        session_id: &str,
        artifact: NewArtifact,
    ) -> CollabResult<Artifact> {
        self.with_session(session_id, |session| {
            let now = Utc::now();
            let id = artifact
                .id
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            if let Some(existing) = session.artifacts.iter_mut().find(|a| a.id == id) {
                existing.version += 1;
                existing.artifact_type = artifact.artifact_type;
                existing.name = artifact.name;
                existing.content = artifact.content;
                existing.produced_by = artifact.produced_by;
                existing.produced_at = now;
                if let Some(citations) = artifact.citations {
                    existing.citations = citations;
                }
                if let Some(dependencies) = artifact.dependencies {
                    existing.dependencies = dependencies;
                }
                log::debug!(
                    "nero::session: artifact {} updated to v{} in {}",
                    existing.id,
                    existing.version,
                    session.id
                );
                return Ok(existing.clone());
            }

            let stored = Artifact {
                id,
                artifact_type: artifact.artifact_type,
                name: artifact.name,
                content: artifact.content,
                produced_by: artifact.produced_by,
                produced_at: now,
                version: 1,
                citations: artifact.citations.unwrap_or_default(),
                dependencies: artifact.dependencies.unwrap_or_default(),
            };
            session.artifacts.push(stored.clone());
            log::debug!("nero::session: artifact {} stored in {}", stored.id, session.id);
            Ok(stored)
        })
        .await
    }

    pub async fn get_artifact(&self, session_id: &str, artifact_id: &str) -> Option<Artifact> {
        self.read_session(session_id, |s| s.artifact(artifact_id).cloned())
            .await
            .flatten()
    }

    /// Artifacts in insertion order; empty for an unknown session.
    pub async fn list_artifacts(&self, session_id: &str) -> Vec<Artifact> {
        self.read_session(session_id, |s| s.artifacts.clone())
            .await
            .unwrap_or_default()
    }

    /// Move a session along its lifecycle: `Active <-> Paused`, then `Completed` or
    /// `Expired`. Closed sessions never reopen.
    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> CollabResult<()> {
        let handle = self.require(session_id).await?;
        let mut session = handle.lock().await;
        if !session.status.can_transition_to(status) {
            return Err(CollabError::InvalidSessionTransition {
                session_id: session.id.clone(),
                from: session.status,
                to: status,
            });
        }
        log::info!(
            "nero::session: {} {} -> {}",
            session.id,
            session.status,
            status
        );
        session.status = status;
        session.touch();
        Ok(())
    }

    pub async fn pause(&self, session_id: &str) -> CollabResult<()> {
        self.set_status(session_id, SessionStatus::Paused).await
    }

    pub async fn resume(&self, session_id: &str) -> CollabResult<()> {
        self.set_status(session_id, SessionStatus::Active).await
    }

    pub async fn complete(&self, session_id: &str) -> CollabResult<()> {
        self.set_status(session_id, SessionStatus::Completed).await
    }

    /// Mark active or paused sessions untouched for longer than `max_idle` as
    /// expired. Returns the ids that were expired.
    pub async fn expire_idle(&self, max_idle: Duration) -> Vec<String> {
        let handles: Vec<Arc<Mutex<Session>>> =
            self.sessions.read().await.values().cloned().collect();
        let now = Utc::now();
        let mut expired = Vec::new();
        for handle in handles {
            let mut session = handle.lock().await;
            if !matches!(session.status, SessionStatus::Active | SessionStatus::Paused) {
                continue;
            }
            let idle_too_long = (now - session.updated_at)
                .to_std()
                .map(|idle| idle > max_idle)
                .unwrap_or(false);
            if idle_too_long {
                session.status = SessionStatus::Expired;
                session.touch();
                expired.push(session.id.clone());
            }
        }
        if !expired.is_empty() {
            log::info!("nero::session: expired {} idle sessions", expired.len());
        }
        expired
    }

    /// Drop a session from the store, returning its final snapshot.
    pub async fn remove_session(&self, session_id: &str) -> Option<Session> {
        let handle = self.sessions.write().await.remove(session_id)?;
        let session = handle.lock().await.clone();
        log::info!("nero::session: removed session {}", session.id);
        Some(session)
    }

    /// Remove completed or expired sessions closed for longer than `older_than`.
    /// Returns the ids that were removed.
    pub async fn purge_closed(&self, older_than: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let mut purged = Vec::new();
        for (id, handle) in sessions.iter() {
            let session = handle.lock().await;
            let stale = (now - session.updated_at)
                .to_std()
                .map(|age| age > older_than)
                .unwrap_or(false);
            if session.status.is_closed() && stale {
                purged.push(id.clone());
            }
        }
        for id in &purged {
            sessions.remove(id);
        }
        if !purged.is_empty() {
            log::info!("nero::session: purged {} closed sessions", purged.len());
        }
        purged
    }

    /// [`expire_idle`](Self::expire_idle) with the configured session TTL.
    pub async fn expire_with_config(&self, config: &NeroConfig) -> Vec<String> {
        self.expire_idle(config.session_idle_ttl).await
    }

    /// Serialise a session (with its artifacts and discussions) as pretty JSON.
    pub async fn export_session(&self, session_id: &str) -> CollabResult<String> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;
        Ok(serde_json::to_string_pretty(&session)?)
    }

    /// Load a session previously produced by [`export_session`](Self::export_session),
    /// replacing any session with the same id.
    pub async fn import_session(&self, json: &str) -> CollabResult<Session> {
        let session: Session = serde_json::from_str(json)?;
        let snapshot = session.clone();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session)));
        Ok(snapshot)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_non_object_initial_context_is_empty() {
        let store = SessionStore::new();
        let session = store.create_session(None, json!([1, 2]), None).await;
        assert!(session.context.is_empty());
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_with_session_does_not_touch_on_error() {
        let store = SessionStore::new();
        let session = store.create_session(None, json!({}), None).await;
        let result: CollabResult<()> = store
            .with_session(&session.id, |_| Err(CollabError::ActionItemNotFound("x".into())))
            .await;
        assert!(result.is_err());
        let after = store.get_session(&session.id).await.unwrap();
        assert_eq!(after.updated_at, session.updated_at);
    }
}
