//! Row operations for messages across all four patterns
//!
//! Filters are expressed as nullable binds so every query stays a single
//! prepared statement: a `NULL` parameter disables its clause. Unread
//! consumption marks rows read in the same statement via an UPDATE ... FROM
//! CTE, which keeps read-and-mark atomic without an explicit transaction.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use crate::domain_types::{AgentId, MeetingId, MessageId, SessionId};
use crate::error::CoordinationError;
use crate::models::{Message, MessageFilter, MessageType};

const INSERT_MESSAGE: &str = r"
INSERT INTO messages (id, sender_id, recipient_id, session_id, meeting_id, message_type, content, metadata, read_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
RETURNING id, sender_id, recipient_id, session_id, meeting_id, message_type, content, metadata, read_at, created_at;
";

const UPDATE_UNREAD_MARK_READ: &str = r"
WITH unread AS (
    SELECT id FROM messages
    WHERE recipient_id = $1
      AND read_at IS NULL
      AND ($2::text IS NULL OR message_type = $2)
      AND ($3::jsonb IS NULL OR metadata @> $3)
)
UPDATE messages m
SET read_at = now()
FROM unread u
WHERE m.id = u.id
RETURNING m.id, m.sender_id, m.recipient_id, m.session_id, m.meeting_id, m.message_type, m.content, m.metadata, m.read_at, m.created_at;
";

const SELECT_SESSION_MESSAGES: &str = r"
SELECT id, sender_id, recipient_id, session_id, meeting_id, message_type, content, metadata, read_at, created_at
FROM messages
WHERE session_id = $1
  AND ($2::text IS NULL OR message_type = $2)
  AND ($3::jsonb IS NULL OR metadata @> $3)
ORDER BY created_at ASC, id ASC;
";

const SELECT_MEETING_MESSAGES: &str = r"
SELECT id, sender_id, recipient_id, session_id, meeting_id, message_type, content, metadata, read_at, created_at
FROM messages
WHERE meeting_id = $1
  AND ($2::text IS NULL OR message_type = $2)
  AND ($3::jsonb IS NULL OR metadata @> $3)
ORDER BY created_at ASC, id ASC;
";

const SELECT_UNREAD_REPLY: &str = r"
SELECT id, sender_id, recipient_id, session_id, meeting_id, message_type, content, metadata, read_at, created_at
FROM messages
WHERE session_id = $1
  AND sender_id = $2
  AND recipient_id = $3
  AND message_type = 'user_defined'
  AND read_at IS NULL
ORDER BY created_at ASC, id ASC
LIMIT 1;
";

const MARK_READ: &str = r"
UPDATE messages SET read_at = now() WHERE id = ANY($1) AND read_at IS NULL;
";

const MARK_READ_RETURNING: &str = r"
UPDATE messages SET read_at = now()
WHERE id = $1
RETURNING id, sender_id, recipient_id, session_id, meeting_id, message_type, content, metadata, read_at, created_at;
";

/// Parameters for one message insert
pub(crate) struct NewMessage<'a> {
    pub sender_id: AgentId,
    pub recipient_id: Option<AgentId>,
    pub session_id: Option<SessionId>,
    pub meeting_id: Option<MeetingId>,
    pub message_type: MessageType,
    pub content: &'a Value,
    pub metadata: Option<&'a Value>,
    pub read_at: Option<DateTime<Utc>>,
}

fn parse_message(row: &PgRow) -> Result<Message, CoordinationError> {
    Ok(Message {
        id: MessageId::new(row.try_get::<Uuid, _>("id")?),
        sender_id: AgentId::new(row.try_get::<Uuid, _>("sender_id")?),
        recipient_id: row
            .try_get::<Option<Uuid>, _>("recipient_id")?
            .map(AgentId::new),
        session_id: row
            .try_get::<Option<Uuid>, _>("session_id")?
            .map(SessionId::new),
        meeting_id: row
            .try_get::<Option<Uuid>, _>("meeting_id")?
            .map(MeetingId::new),
        message_type: MessageType::parse(row.try_get::<&str, _>("message_type")?)?,
        content: row.try_get("content")?,
        metadata: row.try_get("metadata")?,
        read_at: row.try_get("read_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_messages(rows: &[PgRow]) -> Result<Vec<Message>, CoordinationError> {
    rows.iter().map(parse_message).collect()
}

pub(crate) async fn insert_message(
    executor: impl PgExecutor<'_>,
    new: NewMessage<'_>,
) -> Result<Message, CoordinationError> {
    let row = sqlx::query(INSERT_MESSAGE)
        .bind(MessageId::generate().into_inner())
        .bind(new.sender_id.into_inner())
        .bind(new.recipient_id.map(AgentId::into_inner))
        .bind(new.session_id.map(SessionId::into_inner))
        .bind(new.meeting_id.map(MeetingId::into_inner))
        .bind(new.message_type.as_str())
        .bind(new.content)
        .bind(new.metadata)
        .bind(new.read_at)
        .fetch_one(executor)
        .await?;
    parse_message(&row)
}

/// Consumes unread messages for a recipient: marks them read and returns
/// them ordered by `created_at`. A second call returns nothing.
pub(crate) async fn consume_unread(
    executor: impl PgExecutor<'_>,
    recipient_id: AgentId,
    filter: &MessageFilter,
) -> Result<Vec<Message>, CoordinationError> {
    let rows = sqlx::query(UPDATE_UNREAD_MARK_READ)
        .bind(recipient_id.into_inner())
        .bind(filter.message_type.map(MessageType::as_str))
        .bind(filter.metadata_contains.as_ref())
        .fetch_all(executor)
        .await?;
    let mut messages = parse_messages(&rows)?;
    // RETURNING order is not defined; re-establish the delivery order.
    messages.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.id.into_inner().cmp(&right.id.into_inner()))
    });
    Ok(messages)
}

pub(crate) async fn fetch_session_messages(
    executor: impl PgExecutor<'_>,
    session_id: SessionId,
    filter: &MessageFilter,
) -> Result<Vec<Message>, CoordinationError> {
    let rows = sqlx::query(SELECT_SESSION_MESSAGES)
        .bind(session_id.into_inner())
        .bind(filter.message_type.map(MessageType::as_str))
        .bind(filter.metadata_contains.as_ref())
        .fetch_all(executor)
        .await?;
    parse_messages(&rows)
}

pub(crate) async fn fetch_meeting_messages(
    executor: impl PgExecutor<'_>,
    meeting_id: MeetingId,
    filter: &MessageFilter,
) -> Result<Vec<Message>, CoordinationError> {
    let rows = sqlx::query(SELECT_MEETING_MESSAGES)
        .bind(meeting_id.into_inner())
        .bind(filter.message_type.map(MessageType::as_str))
        .bind(filter.metadata_contains.as_ref())
        .fetch_all(executor)
        .await?;
    parse_messages(&rows)
}

/// Looks for a reply that arrived through a concurrent asynchronous send:
/// the earliest unread user message from `sender` to `recipient` within the
/// session.
pub(crate) async fn find_unread_reply(
    executor: impl PgExecutor<'_>,
    session_id: SessionId,
    sender_id: AgentId,
    recipient_id: AgentId,
) -> Result<Option<Message>, CoordinationError> {
    let row = sqlx::query(SELECT_UNREAD_REPLY)
        .bind(session_id.into_inner())
        .bind(sender_id.into_inner())
        .bind(recipient_id.into_inner())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_message).transpose()
}

pub(crate) async fn mark_read(
    executor: impl PgExecutor<'_>,
    message_ids: &[MessageId],
) -> Result<(), CoordinationError> {
    let ids: Vec<Uuid> = message_ids.iter().map(|id| id.into_inner()).collect();
    sqlx::query(MARK_READ).bind(ids).execute(executor).await?;
    Ok(())
}

/// Marks one message read and returns its refreshed row
pub(crate) async fn mark_read_returning(
    executor: impl PgExecutor<'_>,
    message_id: MessageId,
) -> Result<Option<Message>, CoordinationError> {
    let row = sqlx::query(MARK_READ_RETURNING)
        .bind(message_id.into_inner())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_message).transpose()
}
