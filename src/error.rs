//! Error types for the coordination kernel

use std::time::Duration;

use thiserror::Error;

use crate::domain_types::{AgentId, MeetingId, SessionId};
use crate::handlers::HandlerKind;

/// Result alias used throughout the crate
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Error taxonomy for every public coordination operation.
///
/// Validation and state-machine violations surface to the caller; handler
/// callback errors never do (they are caught, logged, and reported as an
/// `Errored` dispatch outcome). Store failures surface so the caller can
/// decide whether to retry.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// A referenced organization, agent, session, or meeting does not exist
    #[error("{entity} not found: {identifier}")]
    NotFound {
        /// Kind of entity that was looked up
        entity: &'static str,
        /// The identifier that failed to resolve
        identifier: String,
    },

    /// A uniqueness or state conflict on create or transition
    #[error("conflict: {reason}")]
    Conflict {
        /// Human-readable description of the conflicting state
        reason: String,
    },

    /// The handler kind required by the operation is not registered
    #[error("no handler registered for kind {kind}")]
    NoHandler {
        /// Handler kind the operation requires
        kind: HandlerKind,
    },

    /// Another synchronous exchange currently holds the session's advisory lock
    #[error("session {session_id} is busy with another synchronous exchange")]
    SessionBusy {
        /// Session whose advisory lock was contended
        session_id: SessionId,
    },

    /// Operation attempted on an ended session
    #[error("session {session_id} has ended")]
    SessionEnded {
        /// The terminated session
        session_id: SessionId,
    },

    /// Operation attempted on an ended meeting
    #[error("meeting {meeting_id} has ended")]
    MeetingEnded {
        /// The terminated meeting
        meeting_id: MeetingId,
    },

    /// A meeting send from a participant that is not the current speaker
    #[error("agent {agent_id} is not the current speaker in meeting {meeting_id}")]
    NotYourTurn {
        /// Meeting the send was attempted in
        meeting_id: MeetingId,
        /// Agent that attempted to speak out of turn
        agent_id: AgentId,
    },

    /// A blocking wait elapsed without a response
    #[error("timed out after {waited:?} waiting for a response")]
    Timeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// The same agent is already blocked in a synchronous wait on this session
    #[error("agent {agent_id} is already waiting on session {session_id}")]
    SessionLockConflict {
        /// Session the duplicate wait targeted
        session_id: SessionId,
        /// Agent that is already waiting
        agent_id: AgentId,
    },

    /// The coordinator was released while the operation was pending
    #[error("coordinator is shutting down")]
    Shutdown,

    /// The durable store could not be reached
    #[error("store unavailable: {source}")]
    StoreUnavailable {
        /// Underlying driver error
        #[source]
        source: sqlx::Error,
    },

    /// Any other durable-store failure
    #[error("store error: {source}")]
    Store {
        /// Underlying driver error
        #[source]
        source: sqlx::Error,
    },

    /// Embedded schema migration failed during startup
    #[error("migration failed: {source}")]
    Migration {
        /// Underlying migration error
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    /// Malformed input: empty ids, out-of-range timeouts, bad durations
    #[error("validation failed: {field} - {reason}")]
    Validation {
        /// Input field that failed validation
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

impl CoordinationError {
    /// Shorthand for a [`CoordinationError::Validation`] value
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`CoordinationError::NotFound`] value
    pub(crate) fn not_found(entity: &'static str, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            identifier: identifier.into(),
        }
    }
}

impl From<sqlx::Error> for CoordinationError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                Self::Conflict {
                    reason: db.message().to_string(),
                }
            }
            e @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)) => {
                Self::StoreUnavailable { source: e }
            }
            other => Self::Store { source: other },
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoordinationError {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_map_pool_errors_to_store_unavailable() {
        let mapped = CoordinationError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(mapped, CoordinationError::StoreUnavailable { .. }));
    }

    #[test]
    fn test_should_map_other_driver_errors_to_store() {
        let mapped = CoordinationError::from(sqlx::Error::RowNotFound);
        assert!(matches!(mapped, CoordinationError::Store { .. }));
    }
}
