//! Persistent entity models
//!
//! Plain data mirrors of the seven store tables, plus the status enums and
//! the pair-canonicalisation rule for sessions. Row parsing lives with the
//! store modules; these types carry no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{
    AgentId, EventId, MeetingId, MessageId, OrganizationId, SessionId,
};
use crate::error::CoordinationError;

/// An organization grouping agents under a caller-chosen external id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// Internal identifier
    pub id: OrganizationId,
    /// Caller-chosen unique identifier
    pub external_id: String,
    /// Display name
    pub name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// An agent registered under an organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Internal identifier
    pub id: AgentId,
    /// Caller-chosen globally unique identifier
    pub external_id: String,
    /// Owning organization
    pub organization_id: OrganizationId,
    /// Display name
    pub name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// The pair may exchange messages
    Active,
    /// Terminal: no further sends accepted
    Ended,
}

impl SessionStatus {
    /// Store representation of the status
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    /// Parses the store representation
    pub fn parse(value: &str) -> Result<Self, CoordinationError> {
        match value {
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            unknown => Err(CoordinationError::validation(
                "session_status",
                format!("unknown session status '{unknown}'"),
            )),
        }
    }
}

/// The durable conversational context between exactly two agents.
///
/// The participant pair is stored in canonical order (`agent_a_id <
/// agent_b_id`). `locked_agent_id`, when set, names the participant that is
/// currently suspended in a synchronous wait on this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Internal identifier
    pub id: SessionId,
    /// Smaller participant id of the canonical pair
    pub agent_a_id: AgentId,
    /// Larger participant id of the canonical pair
    pub agent_b_id: AgentId,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Participant suspended in `send_and_wait`, if any
    pub locked_agent_id: Option<AgentId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Set when the session reaches `Ended`
    pub ended_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of a meeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeetingStatus {
    /// Created, no participant has joined yet
    Created,
    /// At least one non-host participant has joined
    Ready,
    /// Started; exactly one participant is speaking
    Active,
    /// Terminal state
    Ended,
}

impl MeetingStatus {
    /// Store representation of the status
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    /// Parses the store representation
    pub fn parse(value: &str) -> Result<Self, CoordinationError> {
        match value {
            "created" => Ok(Self::Created),
            "ready" => Ok(Self::Ready),
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            unknown => Err(CoordinationError::validation(
                "meeting_status",
                format!("unknown meeting status '{unknown}'"),
            )),
        }
    }
}

/// A multi-agent meeting with turn-based speaking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    /// Internal identifier
    pub id: MeetingId,
    /// Agent that created the meeting and controls start/end
    pub host_id: AgentId,
    /// Lifecycle state
    pub status: MeetingStatus,
    /// Current speaker; non-null exactly while `status == Active`
    pub current_speaker_id: Option<AgentId>,
    /// Length of one speaking turn, in milliseconds
    pub turn_duration_ms: i64,
    /// When the current turn began; advances monotonically
    pub turn_started_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Set when the meeting reaches `Ended`
    pub ended_at: Option<DateTime<Utc>>,
}

impl Meeting {
    /// Length of one speaking turn as a [`std::time::Duration`]
    #[must_use]
    pub fn turn_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.turn_duration_ms.max(0) as u64)
    }
}

/// Participation state within one meeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    /// Added to the roster but not yet joined
    Invited,
    /// Joined and present
    Attending,
    /// Present and blocked waiting for its speaking turn
    Waiting,
    /// The current speaker
    Speaking,
    /// Left the meeting; skipped by rotation
    Left,
}

impl ParticipantStatus {
    /// Store representation of the status
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invited => "invited",
            Self::Attending => "attending",
            Self::Waiting => "waiting",
            Self::Speaking => "speaking",
            Self::Left => "left",
        }
    }

    /// Parses the store representation
    pub fn parse(value: &str) -> Result<Self, CoordinationError> {
        match value {
            "invited" => Ok(Self::Invited),
            "attending" => Ok(Self::Attending),
            "waiting" => Ok(Self::Waiting),
            "speaking" => Ok(Self::Speaking),
            "left" => Ok(Self::Left),
            unknown => Err(CoordinationError::validation(
                "participant_status",
                format!("unknown participant status '{unknown}'"),
            )),
        }
    }

    /// Whether the participant is present and eligible for the turn rotation
    #[must_use]
    pub fn is_present(self) -> bool {
        matches!(self, Self::Attending | Self::Waiting | Self::Speaking)
    }
}

/// One agent's membership in one meeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingParticipant {
    /// Meeting this row belongs to
    pub meeting_id: MeetingId,
    /// The participating agent
    pub agent_id: AgentId,
    /// Participation state
    pub status: ParticipantStatus,
    /// 0-based order in which agents were added; defines the turn rotation
    pub join_order: i32,
    /// Whether the agent is suspended in a blocking turn wait
    pub is_locked: bool,
    /// When the agent joined, if it has
    pub joined_at: Option<DateTime<Utc>>,
    /// When the agent left, if it has
    pub left_at: Option<DateTime<Utc>>,
}

/// Origin classification of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Ordinary application payload
    UserDefined,
    /// System-originated informational message
    System,
    /// System marker persisted when a synchronous wait or turn timed out
    Timeout,
    /// System marker persisted when a session or meeting ended
    Ending,
}

impl MessageType {
    /// Store representation of the type
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserDefined => "user_defined",
            Self::System => "system",
            Self::Timeout => "timeout",
            Self::Ending => "ending",
        }
    }

    /// Parses the store representation
    pub fn parse(value: &str) -> Result<Self, CoordinationError> {
        match value {
            "user_defined" => Ok(Self::UserDefined),
            "system" => Ok(Self::System),
            "timeout" => Ok(Self::Timeout),
            "ending" => Ok(Self::Ending),
            unknown => Err(CoordinationError::validation(
                "message_type",
                format!("unknown message type '{unknown}'"),
            )),
        }
    }
}

/// A persisted message in any of the four patterns.
///
/// Exactly one of `recipient_id` or `meeting_id` is set: one-way messages
/// carry `recipient_id` only, session messages carry `recipient_id` plus
/// `session_id`, meeting messages carry `meeting_id` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Internal identifier
    pub id: MessageId,
    /// Originating agent
    pub sender_id: AgentId,
    /// Addressed agent, for one-way and session messages
    pub recipient_id: Option<AgentId>,
    /// Owning session, for session messages
    pub session_id: Option<SessionId>,
    /// Owning meeting, for meeting messages
    pub meeting_id: Option<MeetingId>,
    /// Origin classification
    pub message_type: MessageType,
    /// Application payload
    pub content: Value,
    /// Optional caller metadata, queryable by JSON containment
    pub metadata: Option<Value>,
    /// Set on first delivery to the consumer
    pub read_at: Option<DateTime<Utc>>,
    /// Persistence time; per-session/per-meeting ordering key
    pub created_at: DateTime<Utc>,
}

/// Kinds of state-visible meeting changes recorded in the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeetingEventType {
    /// The host started the meeting
    MeetingStarted,
    /// The speaking turn rotated
    TurnChanged,
    /// The meeting reached its terminal state
    MeetingEnded,
    /// A participant joined
    ParticipantJoined,
    /// A participant left
    ParticipantLeft,
    /// The current speaker's turn elapsed without a yield
    TurnTimeout,
}

impl MeetingEventType {
    /// Store representation of the event type
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MeetingStarted => "meeting_started",
            Self::TurnChanged => "turn_changed",
            Self::MeetingEnded => "meeting_ended",
            Self::ParticipantJoined => "participant_joined",
            Self::ParticipantLeft => "participant_left",
            Self::TurnTimeout => "turn_timeout",
        }
    }

    /// Parses the store representation
    pub fn parse(value: &str) -> Result<Self, CoordinationError> {
        match value {
            "meeting_started" => Ok(Self::MeetingStarted),
            "turn_changed" => Ok(Self::TurnChanged),
            "meeting_ended" => Ok(Self::MeetingEnded),
            "participant_joined" => Ok(Self::ParticipantJoined),
            "participant_left" => Ok(Self::ParticipantLeft),
            "turn_timeout" => Ok(Self::TurnTimeout),
            unknown => Err(CoordinationError::validation(
                "event_type",
                format!("unknown meeting event type '{unknown}'"),
            )),
        }
    }
}

/// One row of the append-only meeting audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingEvent {
    /// Internal identifier
    pub id: EventId,
    /// Meeting the event belongs to
    pub meeting_id: MeetingId,
    /// What happened
    pub event_type: MeetingEventType,
    /// Agent the event concerns, if any
    pub agent_id: Option<AgentId>,
    /// Event payload
    pub data: Value,
    /// Append time
    pub created_at: DateTime<Utc>,
}

/// Optional filters for message queries
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Restrict to a single message type
    pub message_type: Option<MessageType>,
    /// Restrict to messages whose metadata contains this JSON value (`@>`)
    pub metadata_contains: Option<Value>,
}

/// Orders a participant pair canonically so `(x, y)` and `(y, x)` resolve to
/// the same session row.
#[must_use]
pub fn canonical_pair(x: AgentId, y: AgentId) -> (AgentId, AgentId) {
    if x <= y { (x, y) } else { (y, x) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    #[test]
    fn test_should_round_trip_all_status_strings() {
        for status in [SessionStatus::Active, SessionStatus::Ended] {
            assert_eq!(SessionStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [
            MeetingStatus::Created,
            MeetingStatus::Ready,
            MeetingStatus::Active,
            MeetingStatus::Ended,
        ] {
            assert_eq!(MeetingStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [
            ParticipantStatus::Invited,
            ParticipantStatus::Attending,
            ParticipantStatus::Waiting,
            ParticipantStatus::Speaking,
            ParticipantStatus::Left,
        ] {
            assert_eq!(ParticipantStatus::parse(status.as_str()).unwrap(), status);
        }
        for message_type in [
            MessageType::UserDefined,
            MessageType::System,
            MessageType::Timeout,
            MessageType::Ending,
        ] {
            assert_eq!(MessageType::parse(message_type.as_str()).unwrap(), message_type);
        }
        for event_type in [
            MeetingEventType::MeetingStarted,
            MeetingEventType::TurnChanged,
            MeetingEventType::MeetingEnded,
            MeetingEventType::ParticipantJoined,
            MeetingEventType::ParticipantLeft,
            MeetingEventType::TurnTimeout,
        ] {
            assert_eq!(MeetingEventType::parse(event_type.as_str()).unwrap(), event_type);
        }
    }

    #[test]
    fn test_should_reject_unknown_status_strings() {
        assert!(SessionStatus::parse("paused").is_err());
        assert!(MessageType::parse("").is_err());
    }

    proptest! {
        #[test]
        fn prop_canonical_pair_is_order_insensitive(a in any::<u128>(), b in any::<u128>()) {
            let x = AgentId::new(Uuid::from_u128(a));
            let y = AgentId::new(Uuid::from_u128(b));
            prop_assert_eq!(canonical_pair(x, y), canonical_pair(y, x));
            let (first, second) = canonical_pair(x, y);
            prop_assert!(first <= second);
        }
    }
}
