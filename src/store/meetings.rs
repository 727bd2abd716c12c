//! Row operations for meetings, participants, and the event log

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use crate::domain_types::{AgentId, EventId, MeetingId};
use crate::error::CoordinationError;
use crate::models::{
    Meeting, MeetingEvent, MeetingEventType, MeetingParticipant, MeetingStatus, ParticipantStatus,
};

const MEETING_COLUMNS: &str =
    "id, host_id, status, current_speaker_id, turn_duration_ms, turn_started_at, created_at, ended_at";

const PARTICIPANT_COLUMNS: &str =
    "meeting_id, agent_id, status, join_order, is_locked, joined_at, left_at";

fn parse_meeting(row: &PgRow) -> Result<Meeting, CoordinationError> {
    Ok(Meeting {
        id: MeetingId::new(row.try_get::<Uuid, _>("id")?),
        host_id: AgentId::new(row.try_get::<Uuid, _>("host_id")?),
        status: MeetingStatus::parse(row.try_get::<&str, _>("status")?)?,
        current_speaker_id: row
            .try_get::<Option<Uuid>, _>("current_speaker_id")?
            .map(AgentId::new),
        turn_duration_ms: row.try_get("turn_duration_ms")?,
        turn_started_at: row.try_get("turn_started_at")?,
        created_at: row.try_get("created_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn parse_participant(row: &PgRow) -> Result<MeetingParticipant, CoordinationError> {
    Ok(MeetingParticipant {
        meeting_id: MeetingId::new(row.try_get::<Uuid, _>("meeting_id")?),
        agent_id: AgentId::new(row.try_get::<Uuid, _>("agent_id")?),
        status: ParticipantStatus::parse(row.try_get::<&str, _>("status")?)?,
        join_order: row.try_get("join_order")?,
        is_locked: row.try_get("is_locked")?,
        joined_at: row.try_get("joined_at")?,
        left_at: row.try_get("left_at")?,
    })
}

fn parse_event(row: &PgRow) -> Result<MeetingEvent, CoordinationError> {
    Ok(MeetingEvent {
        id: EventId::new(row.try_get::<Uuid, _>("id")?),
        meeting_id: MeetingId::new(row.try_get::<Uuid, _>("meeting_id")?),
        event_type: MeetingEventType::parse(row.try_get::<&str, _>("event_type")?)?,
        agent_id: row.try_get::<Option<Uuid>, _>("agent_id")?.map(AgentId::new),
        data: row.try_get("data")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) async fn insert_meeting(
    executor: impl PgExecutor<'_>,
    host_id: AgentId,
    turn_duration_ms: i64,
) -> Result<Meeting, CoordinationError> {
    let sql = format!(
        "INSERT INTO meetings (id, host_id, status, turn_duration_ms) \
         VALUES ($1, $2, 'created', $3) RETURNING {MEETING_COLUMNS};"
    );
    let row = sqlx::query(&sql)
        .bind(MeetingId::generate().into_inner())
        .bind(host_id.into_inner())
        .bind(turn_duration_ms)
        .fetch_one(executor)
        .await?;
    parse_meeting(&row)
}

pub(crate) async fn fetch_meeting(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
) -> Result<Option<Meeting>, CoordinationError> {
    let sql = format!("SELECT {MEETING_COLUMNS} FROM meetings WHERE id = $1;");
    let row = sqlx::query(&sql)
        .bind(meeting_id.into_inner())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_meeting).transpose()
}

/// Fetches the meeting row with `FOR UPDATE`, serialising rotation against
/// concurrent `leave`/`end_meeting` transactions.
pub(crate) async fn fetch_meeting_for_update(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
) -> Result<Option<Meeting>, CoordinationError> {
    let sql = format!("SELECT {MEETING_COLUMNS} FROM meetings WHERE id = $1 FOR UPDATE;");
    let row = sqlx::query(&sql)
        .bind(meeting_id.into_inner())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_meeting).transpose()
}

pub(crate) async fn mark_ready(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
) -> Result<(), CoordinationError> {
    sqlx::query("UPDATE meetings SET status = 'ready' WHERE id = $1 AND status = 'created';")
        .bind(meeting_id.into_inner())
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn activate_meeting(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    first_speaker: AgentId,
) -> Result<(), CoordinationError> {
    sqlx::query(
        "UPDATE meetings \
         SET status = 'active', current_speaker_id = $2, turn_started_at = now() \
         WHERE id = $1;",
    )
    .bind(meeting_id.into_inner())
    .bind(first_speaker.into_inner())
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn set_current_speaker(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    speaker: AgentId,
) -> Result<(), CoordinationError> {
    sqlx::query(
        "UPDATE meetings SET current_speaker_id = $2, turn_started_at = now() WHERE id = $1;",
    )
    .bind(meeting_id.into_inner())
    .bind(speaker.into_inner())
    .execute(executor)
    .await?;
    Ok(())
}

/// Transitions a meeting to `ended`. Returns `None` when it already was.
pub(crate) async fn end_meeting_row(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
) -> Result<Option<Meeting>, CoordinationError> {
    let sql = format!(
        "UPDATE meetings \
         SET status = 'ended', ended_at = now(), current_speaker_id = NULL \
         WHERE id = $1 AND status <> 'ended' RETURNING {MEETING_COLUMNS};"
    );
    let row = sqlx::query(&sql)
        .bind(meeting_id.into_inner())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_meeting).transpose()
}

pub(crate) async fn insert_participant(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    agent_id: AgentId,
    join_order: i32,
    status: ParticipantStatus,
) -> Result<MeetingParticipant, CoordinationError> {
    let sql = format!(
        "INSERT INTO meeting_participants (meeting_id, agent_id, status, join_order) \
         VALUES ($1, $2, $3, $4) RETURNING {PARTICIPANT_COLUMNS};"
    );
    let row = sqlx::query(&sql)
        .bind(meeting_id.into_inner())
        .bind(agent_id.into_inner())
        .bind(status.as_str())
        .bind(join_order)
        .fetch_one(executor)
        .await?;
    parse_participant(&row)
}

pub(crate) async fn next_join_order(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
) -> Result<i32, CoordinationError> {
    let next: i32 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(join_order) + 1, 0) FROM meeting_participants WHERE meeting_id = $1;",
    )
    .bind(meeting_id.into_inner())
    .fetch_one(executor)
    .await?;
    Ok(next)
}

pub(crate) async fn fetch_participant(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    agent_id: AgentId,
) -> Result<Option<MeetingParticipant>, CoordinationError> {
    let sql = format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM meeting_participants \
         WHERE meeting_id = $1 AND agent_id = $2;"
    );
    let row = sqlx::query(&sql)
        .bind(meeting_id.into_inner())
        .bind(agent_id.into_inner())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_participant).transpose()
}

/// All participants of a meeting in rotation order
pub(crate) async fn fetch_participants(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
) -> Result<Vec<MeetingParticipant>, CoordinationError> {
    let sql = format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM meeting_participants \
         WHERE meeting_id = $1 ORDER BY join_order ASC;"
    );
    let rows = sqlx::query(&sql)
        .bind(meeting_id.into_inner())
        .fetch_all(executor)
        .await?;
    rows.iter().map(parse_participant).collect()
}

pub(crate) async fn set_participant_status(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    agent_id: AgentId,
    status: ParticipantStatus,
) -> Result<(), CoordinationError> {
    sqlx::query(
        "UPDATE meeting_participants SET status = $3 WHERE meeting_id = $1 AND agent_id = $2;",
    )
    .bind(meeting_id.into_inner())
    .bind(agent_id.into_inner())
    .bind(status.as_str())
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn mark_participant_joined(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    agent_id: AgentId,
) -> Result<(), CoordinationError> {
    sqlx::query(
        "UPDATE meeting_participants \
         SET status = 'attending', joined_at = now() \
         WHERE meeting_id = $1 AND agent_id = $2;",
    )
    .bind(meeting_id.into_inner())
    .bind(agent_id.into_inner())
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn mark_participant_left(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    agent_id: AgentId,
) -> Result<(), CoordinationError> {
    sqlx::query(
        "UPDATE meeting_participants \
         SET status = 'left', left_at = now(), is_locked = FALSE \
         WHERE meeting_id = $1 AND agent_id = $2;",
    )
    .bind(meeting_id.into_inner())
    .bind(agent_id.into_inner())
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn set_participant_locked(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    agent_id: AgentId,
    is_locked: bool,
) -> Result<(), CoordinationError> {
    sqlx::query(
        "UPDATE meeting_participants SET is_locked = $3 WHERE meeting_id = $1 AND agent_id = $2;",
    )
    .bind(meeting_id.into_inner())
    .bind(agent_id.into_inner())
    .bind(is_locked)
    .execute(executor)
    .await?;
    Ok(())
}

/// Clears the blocking-turn-wait markers: `is_locked` always, and a
/// still-`waiting` status reverts to `attending`.
pub(crate) async fn release_turn_wait(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    agent_id: AgentId,
) -> Result<(), CoordinationError> {
    sqlx::query(
        "UPDATE meeting_participants \
         SET is_locked = FALSE, \
             status = CASE WHEN status = 'waiting' THEN 'attending' ELSE status END \
         WHERE meeting_id = $1 AND agent_id = $2;",
    )
    .bind(meeting_id.into_inner())
    .bind(agent_id.into_inner())
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn insert_event(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    event_type: MeetingEventType,
    agent_id: Option<AgentId>,
    data: &Value,
) -> Result<MeetingEvent, CoordinationError> {
    let row = sqlx::query(
        "INSERT INTO meeting_events (id, meeting_id, event_type, agent_id, data) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING id, meeting_id, event_type, agent_id, data, created_at;",
    )
    .bind(EventId::generate().into_inner())
    .bind(meeting_id.into_inner())
    .bind(event_type.as_str())
    .bind(agent_id.map(AgentId::into_inner))
    .bind(data)
    .fetch_one(executor)
    .await?;
    parse_event(&row)
}

pub(crate) async fn fetch_events(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
) -> Result<Vec<MeetingEvent>, CoordinationError> {
    let rows = sqlx::query(
        "SELECT id, meeting_id, event_type, agent_id, data, created_at \
         FROM meeting_events WHERE meeting_id = $1 ORDER BY created_at ASC, id ASC;",
    )
    .bind(meeting_id.into_inner())
    .fetch_all(executor)
    .await?;
    rows.iter().map(parse_event).collect()
}
