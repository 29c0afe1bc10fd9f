use async_trait::async_trait;
use nero::config::{EndpointConfig, Transport};
use nero::discussion::{
    ActionItem, ActionStatus, Assignee, DiscussionEngine, DiscussionEventKind, DiscussionLogEntry,
    DiscussionStatus, MessageKind, NewMessage, Priority, Resolution, ResolutionKind,
};
use nero::error::CollabError;
use nero::event::EventHandler;
use nero::registry::ClientRegistry;
use nero::session::{Citation, SessionStore};
use nero::tool_protocol::{ErrorKind, ToolRequest};
use nero::tool_protocols::LocalToolProtocol;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn engine_with_session() -> (DiscussionEngine, String) {
    let store = Arc::new(SessionStore::new());
    let session = store.create_session(None, json!({}), None).await;
    (DiscussionEngine::new(store), session.id)
}

fn consensus() -> Resolution {
    Resolution::new(
        ResolutionKind::Consensus,
        "Boiler 2 exceeded its NOx limit",
        "File a deviation report",
    )
    .with_agreeing(vec!["monitor".into(), "permit".into()])
    .with_reasoning("Both readings exceed 40 ppm")
}

#[tokio::test]
async fn test_discussion_flow_to_resolution() {
    let (engine, session_id) = engine_with_session().await;
    let discussion = engine
        .start_discussion(
            &session_id,
            "Is the NOx limit exceeded?",
            vec!["monitor".into(), "permit".into(), "monitor".into()],
        )
        .await
        .unwrap();
    assert_eq!(discussion.status, DiscussionStatus::Active);
    assert_eq!(discussion.participants, vec!["monitor", "permit"]);

    let question = engine
        .add_message(
            &session_id,
            &discussion.id,
            NewMessage::new("permit", MessageKind::Question, "Which unit?"),
        )
        .await
        .unwrap();
    let answer = engine
        .add_message(
            &session_id,
            &discussion.id,
            NewMessage::new("monitor", MessageKind::Response, "Boiler 2")
                .in_response_to(&question.id)
                .with_citation(Citation::new("cems", "boiler-2/2026-09"))
                .with_confidence(0.9),
        )
        .await
        .unwrap();
    assert_eq!(answer.in_response_to.as_deref(), Some(question.id.as_str()));

    let resolved = engine
        .resolve_discussion(&session_id, &discussion.id, consensus())
        .await
        .unwrap();
    assert_eq!(resolved.status, DiscussionStatus::Resolved);
    assert!(resolved.completed_at.is_some());
    assert_eq!(resolved.messages.len(), 2);
    assert_eq!(resolved.messages[0].id, question.id);
    assert_eq!(resolved.messages[1].id, answer.id);

    let session = engine.store().get_session(&session_id).await.unwrap();
    assert!(session.participants.contains("permit"));
    let stored = session.discussion(&discussion.id).unwrap();
    let resolution = stored.resolution.as_ref().unwrap();
    assert_eq!(resolution.kind, ResolutionKind::Consensus);
    assert_eq!(resolution.decision, "File a deviation report");
    assert_eq!(resolution.agreeing, vec!["monitor", "permit"]);
}

#[tokio::test]
async fn test_resolve_unknown_ids_is_not_found() {
    let (engine, session_id) = engine_with_session().await;

    let missing_discussion = engine
        .resolve_discussion(&session_id, "nope", consensus())
        .await
        .unwrap_err();
    assert!(matches!(
        missing_discussion,
        CollabError::DiscussionNotFound { .. }
    ));
    assert!(missing_discussion.is_not_found());

    let missing_session = engine
        .resolve_discussion("ghost", "nope", consensus())
        .await
        .unwrap_err();
    assert_eq!(missing_session, CollabError::SessionNotFound("ghost".into()));
}

#[tokio::test]
async fn test_closed_discussion_rejects_messages_and_second_resolve() {
    let (engine, session_id) = engine_with_session().await;
    let discussion = engine
        .start_discussion(&session_id, "topic", vec!["a".into()])
        .await
        .unwrap();
    engine
        .resolve_discussion(&session_id, &discussion.id, consensus())
        .await
        .unwrap();

    let late = engine
        .add_message(
            &session_id,
            &discussion.id,
            NewMessage::new("a", MessageKind::Statement, "one more thing"),
        )
        .await
        .unwrap_err();
    assert_eq!(
        late,
        CollabError::DiscussionClosed {
            discussion_id: discussion.id.clone(),
            status: DiscussionStatus::Resolved,
        }
    );

    let again = engine
        .resolve_discussion(&session_id, &discussion.id, consensus())
        .await
        .unwrap_err();
    assert!(matches!(again, CollabError::DiscussionClosed { .. }));
    assert!(engine
        .escalate_discussion(&session_id, &discussion.id, "too late")
        .await
        .is_err());
}

#[tokio::test]
async fn test_escalate_defer_and_reopen() {
    let (engine, session_id) = engine_with_session().await;
    let first = engine
        .start_discussion(&session_id, "needs a human", vec!["a".into()])
        .await
        .unwrap();
    let second = engine
        .start_discussion(&session_id, "later", vec!["b".into()])
        .await
        .unwrap();

    let escalated = engine
        .escalate_discussion(&session_id, &first.id, "conflicting permits")
        .await
        .unwrap();
    assert_eq!(escalated.status, DiscussionStatus::Escalated);
    assert!(escalated.resolution.is_none());
    assert!(escalated.completed_at.is_some());

    let deferred = engine
        .defer_discussion(&session_id, &second.id, "waiting on data")
        .await
        .unwrap();
    assert_eq!(deferred.status, DiscussionStatus::Deferred);
    assert!(deferred.completed_at.is_some());

    let reopened = engine
        .reopen_discussion(&session_id, &first.id, "human answered")
        .await
        .unwrap();
    assert_eq!(reopened.status, DiscussionStatus::Active);
    assert!(reopened.completed_at.is_none());
    engine
        .add_message(
            &session_id,
            &first.id,
            NewMessage::new("a", MessageKind::Statement, "resuming"),
        )
        .await
        .unwrap();

    let twice = engine
        .reopen_discussion(&session_id, &first.id, "again")
        .await
        .unwrap_err();
    assert!(matches!(twice, CollabError::InvalidTransition { .. }));

    let listed = engine.list_discussions(&session_id).await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first.id);
}

#[tokio::test]
async fn test_action_items_can_be_updated() {
    let (engine, session_id) = engine_with_session().await;
    let discussion = engine
        .start_discussion(&session_id, "follow-ups", vec!["a".into()])
        .await
        .unwrap();
    let item = ActionItem::new(
        "Notify regulator",
        "Send the deviation report",
        Assignee::Human,
        Priority::High,
    );
    let item_id = item.id.clone();
    engine
        .resolve_discussion(
            &session_id,
            &discussion.id,
            consensus().with_action_item(item),
        )
        .await
        .unwrap();

    let blocked = engine
        .update_action_item(
            &session_id,
            &discussion.id,
            &item_id,
            ActionStatus::Blocked,
            Some("waiting for signature".into()),
        )
        .await
        .unwrap();
    assert_eq!(blocked.status, ActionStatus::Blocked);
    assert_eq!(blocked.blocked_reason.as_deref(), Some("waiting for signature"));

    let done = engine
        .update_action_item(&session_id, &discussion.id, &item_id, ActionStatus::Completed, None)
        .await
        .unwrap();
    assert!(done.blocked_reason.is_none());

    let missing = engine
        .update_action_item(&session_id, &discussion.id, "nope", ActionStatus::Completed, None)
        .await
        .unwrap_err();
    assert_eq!(missing, CollabError::ActionItemNotFound("nope".into()));
}

#[tokio::test]
async fn test_tool_backed_message_records_call() {
    let (engine, session_id) = engine_with_session().await;
    let discussion = engine
        .start_discussion(&session_id, "facility lookup", vec!["monitor".into()])
        .await
        .unwrap();

    let local = Arc::new(LocalToolProtocol::new());
    local
        .register_tool(
            "get_facility",
            Arc::new(|args| Ok(json!({ "name": "Plant 4", "query": args.get("id").cloned() }))),
        )
        .await;
    local
        .register_tool("describe", Arc::new(|_args| Ok(json!("Two boilers, one stack"))))
        .await;
    let registry = ClientRegistry::new();
    registry
        .register(
            EndpointConfig::new("frs", Transport::InProcess { name: "frs".into() })
                .with_max_retries(0)
                .with_retry_delay(Duration::from_millis(1)),
            local,
        )
        .await;

    let structured = engine
        .add_tool_backed_message(
            &session_id,
            &discussion.id,
            "monitor",
            MessageKind::Statement,
            &registry,
            ToolRequest::new("frs", "get_facility").with_argument("id", json!("110000350174")),
        )
        .await
        .unwrap();
    let payload: serde_json::Value = serde_json::from_str(&structured.content).unwrap();
    assert_eq!(payload["name"], json!("Plant 4"));
    let trace = structured.tool_call.unwrap();
    assert_eq!(trace.endpoint_id, "frs");
    assert_eq!(trace.tool_name, "get_facility");
    assert!(trace.duration.is_some());

    let text = engine
        .add_tool_backed_message(
            &session_id,
            &discussion.id,
            "monitor",
            MessageKind::Statement,
            &registry,
            ToolRequest::new("frs", "describe"),
        )
        .await
        .unwrap();
    assert_eq!(text.content, "Two boilers, one stack");

    let before = engine.store().get_session(&session_id).await.unwrap().updated_at;
    let failed = engine
        .add_tool_backed_message(
            &session_id,
            &discussion.id,
            "monitor",
            MessageKind::Statement,
            &registry,
            ToolRequest::new("nowhere", "describe"),
        )
        .await
        .unwrap_err();
    match failed {
        CollabError::ToolInvocationFailed(error) => {
            assert_eq!(error.kind, ErrorKind::EndpointNotFound)
        }
        other => panic!("unexpected error: {}", other),
    }
    // A call that appends nothing leaves the idle clock alone
    let after = engine.store().get_session(&session_id).await.unwrap().updated_at;
    assert_eq!(after, before);

    let discussion = engine
        .get_discussion(&session_id, &discussion.id)
        .await
        .unwrap();
    assert_eq!(discussion.messages.len(), 2);
}

struct LogCollector {
    entries: Mutex<Vec<DiscussionLogEntry>>,
}

#[async_trait]
impl EventHandler for LogCollector {
    async fn on_discussion_event(&self, entry: &DiscussionLogEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

#[tokio::test]
async fn test_logs_are_chronological_and_filterable() {
    let store = Arc::new(SessionStore::new());
    let collector = Arc::new(LogCollector {
        entries: Mutex::new(Vec::new()),
    });
    let engine = DiscussionEngine::new(store.clone()).with_event_handler(collector.clone());
    let one = store.create_session(None, json!({}), None).await;
    let two = store.create_session(None, json!({}), None).await;

    let d1 = engine
        .start_discussion(&one.id, "first", vec!["a".into()])
        .await
        .unwrap();
    engine
        .add_message(&one.id, &d1.id, NewMessage::new("a", MessageKind::Proposal, "x"))
        .await
        .unwrap();
    let d2 = engine
        .start_discussion(&two.id, "second", vec!["b".into()])
        .await
        .unwrap();
    engine
        .defer_discussion(&two.id, &d2.id, "later")
        .await
        .unwrap();
    engine
        .resolve_discussion(&one.id, &d1.id, consensus())
        .await
        .unwrap();

    let all = engine.discussion_logs(None);
    assert_eq!(all.len(), 5);
    assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let events: Vec<DiscussionEventKind> = engine
        .discussion_logs(Some(&one.id))
        .iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(
        events,
        vec![
            DiscussionEventKind::Started,
            DiscussionEventKind::MessageSent,
            DiscussionEventKind::Resolved,
        ]
    );
    assert_eq!(engine.discussion_logs(Some(&two.id)).len(), 2);
    assert_eq!(collector.entries.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn test_concurrent_messages_keep_store_order() {
    let store = Arc::new(SessionStore::new());
    let engine = Arc::new(DiscussionEngine::new(store.clone()));
    let session = store.create_session(None, json!({}), None).await;
    let discussion = engine
        .start_discussion(&session.id, "race", vec![])
        .await
        .unwrap();

    let handles: Vec<_> = (0..25)
        .map(|i| {
            let engine = engine.clone();
            let session_id = session.id.clone();
            let discussion_id = discussion.id.clone();
            tokio::spawn(async move {
                engine
                    .add_message(
                        &session_id,
                        &discussion_id,
                        NewMessage::new(format!("agent-{}", i), MessageKind::Statement, "hi"),
                    )
                    .await
                    .unwrap()
                    .id
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let stored = engine
        .get_discussion(&session.id, &discussion.id)
        .await
        .unwrap();
    assert_eq!(stored.messages.len(), 25);
    let logged: Vec<String> = engine
        .discussion_logs(Some(&session.id))
        .iter()
        .filter(|e| e.event == DiscussionEventKind::MessageSent)
        .filter_map(|e| e.details["messageId"].as_str().map(String::from))
        .collect();
    let in_store: Vec<String> = stored.messages.iter().map(|m| m.id.clone()).collect();
    assert_eq!(logged, in_store);
}

#[tokio::test]
async fn test_completed_session_rejects_discussion_changes() {
    let (engine, session_id) = engine_with_session().await;
    let discussion = engine
        .start_discussion(&session_id, "final check", vec!["monitor".into()])
        .await
        .unwrap();
    engine.store().complete(&session_id).await.unwrap();

    let started = engine
        .start_discussion(&session_id, "too late", vec!["permit".into()])
        .await
        .unwrap_err();
    assert!(matches!(started, CollabError::SessionClosed { .. }));

    let message = engine
        .add_message(
            &session_id,
            &discussion.id,
            NewMessage::new("monitor", MessageKind::Statement, "one more thing"),
        )
        .await
        .unwrap_err();
    assert!(matches!(message, CollabError::SessionClosed { .. }));

    let registry = ClientRegistry::new();
    let tool_backed = engine
        .add_tool_backed_message(
            &session_id,
            &discussion.id,
            "monitor",
            MessageKind::Statement,
            &registry,
            ToolRequest::new("frs", "describe"),
        )
        .await
        .unwrap_err();
    assert!(matches!(tool_backed, CollabError::SessionClosed { .. }));

    assert_eq!(engine.list_discussions(&session_id).await.len(), 1);
    assert!(engine.get_discussion(&session_id, &discussion.id).await.unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_purging_closed_sessions_drops_their_logs() {
    let (engine, closed_id) = engine_with_session().await;
    let open = engine.store().create_session(None, json!({}), None).await;
    engine
        .start_discussion(&closed_id, "wrapped up", vec!["a".into()])
        .await
        .unwrap();
    engine
        .start_discussion(&open.id, "ongoing", vec!["b".into()])
        .await
        .unwrap();
    engine.store().complete(&closed_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let purged = engine.purge_closed_sessions(Duration::from_millis(5)).await;
    assert_eq!(purged, vec![closed_id.clone()]);
    assert!(engine.store().get_session(&closed_id).await.is_none());
    assert!(engine.discussion_logs(Some(&closed_id)).is_empty());
    assert_eq!(engine.discussion_logs(None).len(), 1);

    assert_eq!(engine.prune_logs(&open.id), 1);
    assert!(engine.discussion_logs(None).is_empty());
    assert_eq!(engine.store().list_sessions().await.len(), 1);
}
