//! Row operations for pairwise sessions
//!
//! The active pair is unique under a partial index, so concurrent creators
//! race safely: the loser of the `ON CONFLICT DO NOTHING` insert re-selects
//! the winner's row.

use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use crate::domain_types::{AgentId, SessionId};
use crate::error::CoordinationError;
use crate::models::{Session, SessionStatus, canonical_pair};

const SELECT_ACTIVE_SESSION: &str = r"
SELECT id, agent_a_id, agent_b_id, status, locked_agent_id, created_at, ended_at
FROM sessions
WHERE agent_a_id = $1 AND agent_b_id = $2 AND status = 'active';
";

const INSERT_SESSION: &str = r"
INSERT INTO sessions (id, agent_a_id, agent_b_id, status)
VALUES ($1, $2, $3, 'active')
ON CONFLICT (agent_a_id, agent_b_id) WHERE status = 'active' DO NOTHING
RETURNING id, agent_a_id, agent_b_id, status, locked_agent_id, created_at, ended_at;
";

const SELECT_SESSION_BY_ID: &str = r"
SELECT id, agent_a_id, agent_b_id, status, locked_agent_id, created_at, ended_at
FROM sessions
WHERE id = $1;
";

const SET_LOCKED_AGENT: &str = r"
UPDATE sessions SET locked_agent_id = $2 WHERE id = $1 AND status = 'active';
";

const CLEAR_LOCKED_AGENT: &str = r"
UPDATE sessions SET locked_agent_id = NULL WHERE id = $1;
";

const END_SESSION: &str = r"
UPDATE sessions
SET status = 'ended', ended_at = now(), locked_agent_id = NULL
WHERE id = $1 AND status = 'active'
RETURNING id, agent_a_id, agent_b_id, status, locked_agent_id, created_at, ended_at;
";

fn parse_session(row: &PgRow) -> Result<Session, CoordinationError> {
    Ok(Session {
        id: SessionId::new(row.try_get::<Uuid, _>("id")?),
        agent_a_id: AgentId::new(row.try_get::<Uuid, _>("agent_a_id")?),
        agent_b_id: AgentId::new(row.try_get::<Uuid, _>("agent_b_id")?),
        status: SessionStatus::parse(row.try_get::<&str, _>("status")?)?,
        locked_agent_id: row
            .try_get::<Option<Uuid>, _>("locked_agent_id")?
            .map(AgentId::new),
        created_at: row.try_get("created_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

pub(crate) async fn fetch_active_session(
    executor: impl PgExecutor<'_>,
    x: AgentId,
    y: AgentId,
) -> Result<Option<Session>, CoordinationError> {
    let (a, b) = canonical_pair(x, y);
    let row = sqlx::query(SELECT_ACTIVE_SESSION)
        .bind(a.into_inner())
        .bind(b.into_inner())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_session).transpose()
}

/// Selects the unique active session for the pair, inserting one when none
/// exists. Safe under concurrent callers.
pub(crate) async fn resolve_or_create(
    conn: &mut sqlx::PgConnection,
    x: AgentId,
    y: AgentId,
) -> Result<Session, CoordinationError> {
    if let Some(session) = fetch_active_session(&mut *conn, x, y).await? {
        return Ok(session);
    }
    let (a, b) = canonical_pair(x, y);
    let inserted = sqlx::query(INSERT_SESSION)
        .bind(SessionId::generate().into_inner())
        .bind(a.into_inner())
        .bind(b.into_inner())
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(row) = inserted {
        return parse_session(&row);
    }
    // Lost the insert race; the winner's row is now visible.
    fetch_active_session(&mut *conn, x, y)
        .await?
        .ok_or(CoordinationError::Store {
            source: sqlx::Error::RowNotFound,
        })
}

pub(crate) async fn fetch_session_by_id(
    executor: impl PgExecutor<'_>,
    session_id: SessionId,
) -> Result<Option<Session>, CoordinationError> {
    let row = sqlx::query(SELECT_SESSION_BY_ID)
        .bind(session_id.into_inner())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_session).transpose()
}

pub(crate) async fn set_locked_agent(
    executor: impl PgExecutor<'_>,
    session_id: SessionId,
    agent_id: AgentId,
) -> Result<(), CoordinationError> {
    sqlx::query(SET_LOCKED_AGENT)
        .bind(session_id.into_inner())
        .bind(agent_id.into_inner())
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn clear_locked_agent(
    executor: impl PgExecutor<'_>,
    session_id: SessionId,
) -> Result<(), CoordinationError> {
    sqlx::query(CLEAR_LOCKED_AGENT)
        .bind(session_id.into_inner())
        .execute(executor)
        .await?;
    Ok(())
}

/// Transitions an active session to `ended`. Returns `None` when the session
/// was not active.
pub(crate) async fn end_session(
    executor: impl PgExecutor<'_>,
    session_id: SessionId,
) -> Result<Option<Session>, CoordinationError> {
    let row = sqlx::query(END_SESSION)
        .bind(session_id.into_inner())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_session).transpose()
}
