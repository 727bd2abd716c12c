//! End-to-end tests for meeting lifecycle and turn scheduling.
//!
//! These run against a real PostgreSQL server provisioned by `#[sqlx::test]`;
//! set `DATABASE_URL` and drop the `--ignored` filter to run them.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use colloquy::{
    AgentId, CoordinationError, Coordinator, HandlerKind, MeetingEventType, MeetingId,
    MeetingStatus, MessageType, ParticipantStatus,
};
use serde_json::json;
use sqlx::PgPool;

async fn register_room(coordinator: &Coordinator) {
    coordinator
        .register_organization("acme", "Acme Corp")
        .await
        .unwrap();
    for (external_id, name) in [("h", "Host"), ("a", "Ada"), ("b", "Ben"), ("c", "Cyd")] {
        coordinator
            .register_agent(external_id, "acme", name)
            .await
            .unwrap();
    }
}

async fn assemble_meeting(
    coordinator: &Coordinator,
    turn_duration: Duration,
    guests: &[&str],
) -> MeetingId {
    let meeting = coordinator
        .meeting()
        .create("h", Some(turn_duration))
        .await
        .unwrap();
    for guest in guests {
        coordinator.meeting().invite(meeting.id, guest).await.unwrap();
        coordinator.meeting().join(meeting.id, guest).await.unwrap();
    }
    meeting.id
}

async fn agent_id(coordinator: &Coordinator, external_id: &str) -> AgentId {
    coordinator
        .get_agent(external_id)
        .await
        .unwrap()
        .expect("agent should exist")
        .id
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn joining_transitions_meeting_from_created_to_ready(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    register_room(&coordinator).await;

    let meeting = coordinator.meeting().create("h", None).await.unwrap();
    assert_eq!(meeting.status, MeetingStatus::Created);
    assert_eq!(meeting.turn_duration(), Duration::from_secs(60));

    coordinator.meeting().invite(meeting.id, "a").await.unwrap();
    let joined = coordinator.meeting().join(meeting.id, "a").await.unwrap();
    assert_eq!(joined.status, ParticipantStatus::Attending);
    assert_eq!(joined.join_order, 1);

    let refreshed = coordinator.meeting().get(meeting.id).await.unwrap();
    assert_eq!(refreshed.status, MeetingStatus::Ready);
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn stalled_speaker_times_out_and_rotation_advances(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    register_room(&coordinator).await;
    let meeting_id = assemble_meeting(&coordinator, Duration::from_secs(1), &["a", "b", "c"]).await;

    let started = coordinator.meeting().start(meeting_id, "h").await.unwrap();
    let host = agent_id(&coordinator, "h").await;
    assert_eq!(started.status, MeetingStatus::Active);
    assert_eq!(started.current_speaker_id, Some(host));

    // No yield: the 1 s turn elapses and the scheduler rotates to `a`.
    tokio::time::sleep(Duration::from_millis(1700)).await;

    let meeting = coordinator.meeting().get(meeting_id).await.unwrap();
    let ada = agent_id(&coordinator, "a").await;
    assert_eq!(meeting.current_speaker_id, Some(ada));

    let events = coordinator.meeting().events(meeting_id).await.unwrap();
    assert!(events.iter().any(|event| {
        event.event_type == MeetingEventType::TurnTimeout && event.agent_id == Some(host)
    }));

    let messages = coordinator.meeting().messages(meeting_id, None).await.unwrap();
    assert!(
        messages
            .iter()
            .any(|message| message.message_type == MessageType::Timeout)
    );

    // The stalled host is no longer the speaker.
    let error = coordinator
        .meeting()
        .send("h", meeting_id, json!({ "text": "late" }), None)
        .await
        .unwrap_err();
    assert!(matches!(error, CoordinationError::NotYourTurn { .. }));
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn leaving_speaker_triggers_immediate_rotation(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    register_room(&coordinator).await;
    // Long turns so only explicit signals rotate.
    let meeting_id = assemble_meeting(&coordinator, Duration::from_secs(30), &["a", "b"]).await;
    coordinator.meeting().start(meeting_id, "h").await.unwrap();

    coordinator.meeting().yield_turn(meeting_id, "h").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let ada = agent_id(&coordinator, "a").await;
    let meeting = coordinator.meeting().get(meeting_id).await.unwrap();
    assert_eq!(meeting.current_speaker_id, Some(ada));

    coordinator.meeting().leave(meeting_id, "a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ben = agent_id(&coordinator, "b").await;
    let meeting = coordinator.meeting().get(meeting_id).await.unwrap();
    assert_eq!(meeting.current_speaker_id, Some(ben));

    let participants = coordinator.meeting().participants(meeting_id).await.unwrap();
    let ada_row = participants
        .iter()
        .find(|participant| participant.agent_id == ada)
        .unwrap();
    assert_eq!(ada_row.status, ParticipantStatus::Left);

    // participant_left is logged before the rotation it caused.
    let events = coordinator.meeting().events(meeting_id).await.unwrap();
    let left_position = events
        .iter()
        .position(|event| {
            event.event_type == MeetingEventType::ParticipantLeft && event.agent_id == Some(ada)
        })
        .expect("participant_left event");
    let rotation_position = events
        .iter()
        .position(|event| {
            event.event_type == MeetingEventType::TurnChanged && event.agent_id == Some(ben)
        })
        .expect("turn_changed event");
    assert!(left_position < rotation_position);
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn meeting_send_fans_out_to_present_participants(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    register_room(&coordinator).await;
    let meeting_id = assemble_meeting(&coordinator, Duration::from_secs(30), &["a", "b"]).await;

    let deliveries: Arc<Mutex<Vec<AgentId>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = deliveries.clone();
    coordinator.register_handler_fn(HandlerKind::Meeting, move |_content, ctx| {
        sink.lock().unwrap().push(ctx.receiver_id);
        futures::future::ready(Ok(None))
    });

    // Sending before the meeting starts is rejected.
    let error = coordinator
        .meeting()
        .send("h", meeting_id, json!({ "text": "early" }), None)
        .await
        .unwrap_err();
    assert!(matches!(error, CoordinationError::Validation { .. }));

    coordinator.meeting().start(meeting_id, "h").await.unwrap();

    // Only the current speaker may send.
    let error = coordinator
        .meeting()
        .send("a", meeting_id, json!({ "text": "me first" }), None)
        .await
        .unwrap_err();
    assert!(matches!(error, CoordinationError::NotYourTurn { .. }));

    let message = coordinator
        .meeting()
        .send("h", meeting_id, json!({ "text": "welcome" }), None)
        .await
        .unwrap();
    assert_eq!(message.meeting_id, Some(meeting_id));
    assert!(message.recipient_id.is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let ada = agent_id(&coordinator, "a").await;
    let ben = agent_id(&coordinator, "b").await;
    let recorded = deliveries.lock().unwrap();
    assert_eq!(recorded.len(), 2);
    assert!(recorded.contains(&ada));
    assert!(recorded.contains(&ben));
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn ending_the_meeting_fails_blocked_turn_waiters_with_meeting_ended(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    register_room(&coordinator).await;
    let meeting_id = assemble_meeting(&coordinator, Duration::from_secs(30), &["a"]).await;
    coordinator.meeting().start(meeting_id, "h").await.unwrap();

    let waiting = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .meeting()
                .await_turn(meeting_id, "a", Some(Duration::from_secs(10)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    coordinator.meeting().end(meeting_id, "h").await.unwrap();

    let error = waiting.await.unwrap().unwrap_err();
    assert!(
        matches!(error, CoordinationError::MeetingEnded { .. }),
        "expected MeetingEnded, got {error:?}"
    );

    let meeting = coordinator.meeting().get(meeting_id).await.unwrap();
    assert_eq!(meeting.status, MeetingStatus::Ended);
    assert!(meeting.current_speaker_id.is_none());

    // Terminal state rejects further mutations.
    let error = coordinator
        .meeting()
        .send("h", meeting_id, json!({ "text": "anyone?" }), None)
        .await
        .unwrap_err();
    assert!(matches!(error, CoordinationError::MeetingEnded { .. }));
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn meeting_ends_when_only_the_host_remains(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    register_room(&coordinator).await;
    let meeting_id = assemble_meeting(&coordinator, Duration::from_secs(30), &["a"]).await;
    coordinator.meeting().start(meeting_id, "h").await.unwrap();

    coordinator.meeting().leave(meeting_id, "a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let meeting = coordinator.meeting().get(meeting_id).await.unwrap();
    assert_eq!(meeting.status, MeetingStatus::Ended);

    let events = coordinator.meeting().events(meeting_id).await.unwrap();
    assert!(
        events
            .iter()
            .any(|event| event.event_type == MeetingEventType::MeetingEnded)
    );
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL server (DATABASE_URL)"]
async fn awaiting_participant_is_woken_when_its_turn_arrives(pool: PgPool) {
    let coordinator = common::coordinator(pool);
    register_room(&coordinator).await;
    let meeting_id = assemble_meeting(&coordinator, Duration::from_secs(30), &["a"]).await;
    coordinator.meeting().start(meeting_id, "h").await.unwrap();

    let waiting = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .meeting()
                .await_turn(meeting_id, "a", Some(Duration::from_secs(10)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The durable lock marker is set while `a` is parked.
    let ada = agent_id(&coordinator, "a").await;
    let participants = coordinator.meeting().participants(meeting_id).await.unwrap();
    let ada_row = participants
        .iter()
        .find(|participant| participant.agent_id == ada)
        .unwrap();
    assert!(ada_row.is_locked);
    assert_eq!(ada_row.status, ParticipantStatus::Waiting);

    coordinator.meeting().yield_turn(meeting_id, "h").await.unwrap();
    waiting.await.unwrap().unwrap();

    let meeting = coordinator.meeting().get(meeting_id).await.unwrap();
    assert_eq!(meeting.current_speaker_id, Some(ada));
    let participants = coordinator.meeting().participants(meeting_id).await.unwrap();
    let ada_row = participants
        .iter()
        .find(|participant| participant.agent_id == ada)
        .unwrap();
    assert!(!ada_row.is_locked);
    assert_eq!(ada_row.status, ParticipantStatus::Speaking);
}
