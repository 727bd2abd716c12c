//! End-to-end tests for one-way broadcasts and session conversations.
//!
//! These run against a real PostgreSQL server provisioned by `#[sqlx::test]`;
//! set `DATABASE_URL` and drop the `--ignored` filter to run them.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use colloquy::{AgentId, CoordinationError, HandlerKind, MessageType};
use serde_json::{Value, json};
use sqlx::PgPool;

fn recorder() -> (
    Arc<Mutex<Vec<(AgentId, Value)>>>,
    impl Fn(Value, colloquy::MessageContext) -> futures::future::Ready<anyhow::Result<Option<Value>>>
    + Send
    + Sync
    + 'static,
) {
    let calls: Arc<Mutex<Vec<(AgentId, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let callback = move |content: Value, ctx: colloquy::MessageContext| {
        sink.lock().unwrap().push((ctx.receiver_id, content));
        futures::future::ready(Ok(None))
    };
    (calls, callback)
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn one_way_broadcast_reaches_each_recipient_exactly_once(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    common::register_acme(&coordinator).await;

    let (calls, callback) = recorder();
    coordinator.register_handler_fn(HandlerKind::OneWay, callback);

    let message_ids = coordinator
        .one_way()
        .send("alice", &["bob", "charlie"], json!({ "text": "hi" }), None)
        .await
        .unwrap();
    assert_eq!(message_ids.len(), 2);

    // Handler dispatch is fire-and-forget; give it a moment.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let bob = coordinator.get_agent("bob").await.unwrap().unwrap();
    let charlie = coordinator.get_agent("charlie").await.unwrap().unwrap();
    {
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let receivers: Vec<AgentId> = calls.iter().map(|(receiver, _)| *receiver).collect();
        assert!(receivers.contains(&bob.id));
        assert!(receivers.contains(&charlie.id));
        assert!(calls.iter().all(|(_, content)| content == &json!({ "text": "hi" })));
    }

    let unread = coordinator
        .conversation()
        .get_unread_messages("bob", None)
        .await
        .unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].content, json!({ "text": "hi" }));
    assert!(unread[0].session_id.is_none());
    assert!(unread[0].meeting_id.is_none());

    // Consumption is one-shot.
    let again = coordinator
        .conversation()
        .get_unread_messages("bob", None)
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn send_and_wait_returns_fast_path_reply(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    common::register_acme(&coordinator).await;

    coordinator.register_handler_fn(HandlerKind::Conversation, |content, _ctx| async move {
        let question = content["q"].as_str().unwrap_or_default();
        Ok(Some(json!({ "reply": format!("{question}!") })))
    });

    let reply = coordinator
        .conversation()
        .send_and_wait(
            "alice",
            "bob",
            json!({ "q": "ping" }),
            Some(Duration::from_secs(5)),
            None,
        )
        .await
        .unwrap();
    assert_eq!(reply.content, json!({ "reply": "ping!" }));

    let session = coordinator
        .conversation()
        .get_session("alice", "bob")
        .await
        .unwrap()
        .expect("session should exist");
    assert!(session.locked_agent_id.is_none());

    let history = coordinator
        .conversation()
        .get_messages_for_session(session.id, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|message| message.read_at.is_some()));
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn send_and_wait_times_out_when_no_reply_arrives(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    common::register_acme(&coordinator).await;

    coordinator
        .register_handler_fn(HandlerKind::Conversation, |_content, _ctx| async move {
            Ok(None)
        });

    let started = std::time::Instant::now();
    let error = coordinator
        .conversation()
        .send_and_wait(
            "alice",
            "bob",
            json!({ "q": "?" }),
            Some(Duration::from_secs(1)),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(error, CoordinationError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(3));

    let session = coordinator
        .conversation()
        .get_session("alice", "bob")
        .await
        .unwrap()
        .expect("session should exist");
    assert!(session.locked_agent_id.is_none());

    let history = coordinator
        .conversation()
        .get_messages_for_session(session.id, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].message_type, MessageType::UserDefined);
    assert_eq!(history[1].message_type, MessageType::Timeout);
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn notification_fires_only_for_non_waiting_recipients(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    common::register_acme(&coordinator).await;

    coordinator
        .register_handler_fn(HandlerKind::Conversation, |_content, _ctx| async move {
            Ok(None)
        });
    let notifications: Arc<Mutex<Vec<(AgentId, Option<Value>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = notifications.clone();
    coordinator.register_handler_fn(HandlerKind::MessageNotification, move |_content, ctx| {
        sink.lock().unwrap().push((ctx.receiver_id, ctx.metadata));
        futures::future::ready(Ok(None))
    });

    // Bob is not waiting: the notification must fire, carrying the metadata.
    coordinator
        .conversation()
        .send_no_wait(
            "alice",
            "bob",
            json!({ "text": "hi" }),
            Some(json!({ "priority": "high" })),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let bob = coordinator.get_agent("bob").await.unwrap().unwrap();
    {
        let recorded = notifications.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, bob.id);
        assert_eq!(
            recorded[0].1.as_ref().and_then(|m| m["priority"].as_str()),
            Some("high")
        );
    }

    // Now bob blocks in send_and_wait, becoming the locked agent; a second
    // send_no_wait must unblock him directly and raise no notification.
    let waiting = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .conversation()
                .send_and_wait(
                    "bob",
                    "alice",
                    json!({ "q": "anything for me?" }),
                    Some(Duration::from_secs(5)),
                    None,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    coordinator
        .conversation()
        .send_no_wait("alice", "bob", json!({ "text": "yes" }), None)
        .await
        .unwrap();

    let reply = waiting.await.unwrap().unwrap();
    assert_eq!(reply.content, json!({ "text": "yes" }));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(notifications.lock().unwrap().len(), 1);
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn organization_registration_is_idempotent_on_same_name(pool: PgPool) {
    let coordinator = common::coordinator(pool);

    let first = coordinator
        .register_organization("acme", "Acme Corp")
        .await
        .unwrap();
    let second = coordinator
        .register_organization("acme", "Acme Corp")
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    let conflict = coordinator
        .register_organization("acme", "Acme Incorporated")
        .await
        .unwrap_err();
    assert!(matches!(conflict, CoordinationError::Conflict { .. }));
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn concurrent_sync_sends_on_one_session_are_serialised(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    common::register_acme(&coordinator).await;

    coordinator
        .register_handler_fn(HandlerKind::Conversation, |_content, _ctx| async move {
            Ok(None)
        });

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .conversation()
                .send_and_wait(
                    "alice",
                    "bob",
                    json!({ "n": 1 }),
                    Some(Duration::from_secs(2)),
                    None,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let error = coordinator
        .conversation()
        .send_and_wait(
            "alice",
            "bob",
            json!({ "n": 2 }),
            Some(Duration::from_secs(2)),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        CoordinationError::SessionBusy { .. } | CoordinationError::SessionLockConflict { .. }
    ));

    // The first caller times out normally; state is intact afterwards.
    assert!(matches!(
        first.await.unwrap().unwrap_err(),
        CoordinationError::Timeout { .. }
    ));
    let session = coordinator
        .conversation()
        .get_session("alice", "bob")
        .await
        .unwrap()
        .expect("session should exist");
    assert!(session.locked_agent_id.is_none());
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn send_and_wait_rejects_out_of_range_timeouts_and_empty_ids(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    common::register_acme(&coordinator).await;
    coordinator
        .register_handler_fn(HandlerKind::Conversation, |_content, _ctx| async move {
            Ok(None)
        });

    for timeout in [Duration::ZERO, Duration::from_secs(301)] {
        let error = coordinator
            .conversation()
            .send_and_wait("alice", "bob", json!({}), Some(timeout), None)
            .await
            .unwrap_err();
        assert!(matches!(error, CoordinationError::Validation { .. }));
    }

    let error = coordinator
        .conversation()
        .send_and_wait("alice", "", json!({}), Some(Duration::from_secs(1)), None)
        .await
        .unwrap_err();
    assert!(matches!(error, CoordinationError::Validation { .. }));
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn ending_a_session_fails_the_blocked_waiter_with_session_ended(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    common::register_acme(&coordinator).await;
    coordinator
        .register_handler_fn(HandlerKind::Conversation, |_content, _ctx| async move {
            Ok(None)
        });

    let waiting = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .conversation()
                .send_and_wait(
                    "alice",
                    "bob",
                    json!({ "q": "still there?" }),
                    Some(Duration::from_secs(10)),
                    None,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ended = coordinator
        .conversation()
        .end_session("bob", "alice")
        .await
        .unwrap();
    assert!(ended.ended_at.is_some());

    let error = waiting.await.unwrap().unwrap_err();
    assert!(
        matches!(error, CoordinationError::SessionEnded { .. }),
        "expected SessionEnded, got {error:?}"
    );

    let history = coordinator
        .conversation()
        .get_messages_for_session(ended.id, None)
        .await
        .unwrap();
    assert!(
        history
            .iter()
            .any(|message| message.message_type == MessageType::Ending)
    );
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn unread_queries_support_metadata_containment_filters(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    common::register_acme(&coordinator).await;
    coordinator
        .register_handler_fn(HandlerKind::Conversation, |_content, _ctx| async move {
            Ok(None)
        });

    coordinator
        .conversation()
        .send_no_wait(
            "alice",
            "bob",
            json!({ "n": 1 }),
            Some(json!({ "topic": "billing" })),
        )
        .await
        .unwrap();
    coordinator
        .conversation()
        .send_no_wait(
            "alice",
            "bob",
            json!({ "n": 2 }),
            Some(json!({ "topic": "support" })),
        )
        .await
        .unwrap();

    let filter = colloquy::MessageFilter {
        metadata_contains: Some(json!({ "topic": "billing" })),
        ..Default::default()
    };
    let filtered = coordinator
        .conversation()
        .get_unread_messages("bob", Some(filter))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].content, json!({ "n": 1 }));

    // The unfiltered remainder is still unread.
    let rest = coordinator
        .conversation()
        .get_unread_messages("bob", None)
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].content, json!({ "n": 2 }));
}
