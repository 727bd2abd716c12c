//! Strongly-typed domain values for the coordination kernel
//!
//! Identifier newtypes prevent mixing up the many UUID-keyed entities, and
//! validated scalars keep configuration values inside their documented
//! ranges.

use nutype::nutype;
use uuid::Uuid;

/// Unique identifier for an organization
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct OrganizationId(Uuid);

impl OrganizationId {
    /// Creates a new random organization ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for an agent
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct AgentId(Uuid);

impl AgentId {
    /// Creates a new random agent ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a pairwise session
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a meeting
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MeetingId(Uuid);

impl MeetingId {
    /// Creates a new random meeting ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a message
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a meeting event
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Caller-chosen external identifier for an organization or agent.
///
/// External ids are the currency of the public API: every operation resolves
/// them to internal UUIDs at the boundary. Leading and trailing whitespace is
/// trimmed; the result must be non-empty and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into, AsRef,
        Deref
    )
)]
pub struct ExternalId(String);

/// Connection pool size for the store gateway
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 20
)]
pub struct PoolSize(u32);

/// Default timeout for synchronous sends, in seconds (hard cap 300)
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 300),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30
)]
pub struct SyncTimeoutSecs(u64);

impl SyncTimeoutSecs {
    /// Converts to a [`std::time::Duration`]
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Default meeting turn duration, in seconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 86_400),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60
)]
pub struct TurnDurationSecs(u64);

impl TurnDurationSecs {
    /// Converts to a [`std::time::Duration`]
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Budget for the synchronous fast-path handler probe, in milliseconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 100
)]
pub struct FastPathBudgetMs(u64);

impl FastPathBudgetMs {
    /// Converts to a [`std::time::Duration`]
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Upper bound on any single handler invocation, in seconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 300),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30
)]
pub struct HandlerTimeoutSecs(u64);

impl HandlerTimeoutSecs {
    /// Converts to a [`std::time::Duration`]
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_trim_and_accept_valid_external_id() {
        let id = ExternalId::try_new("  alice  ".to_string()).unwrap();
        assert_eq!(id.as_str(), "alice");
    }

    #[test]
    fn test_should_reject_empty_external_id() {
        assert!(ExternalId::try_new(String::new()).is_err());
        assert!(ExternalId::try_new("   ".to_string()).is_err());
    }

    #[test]
    fn test_should_reject_oversized_external_id() {
        assert!(ExternalId::try_new("x".repeat(256)).is_err());
        assert!(ExternalId::try_new("x".repeat(255)).is_ok());
    }

    #[test]
    fn test_should_apply_documented_config_defaults() {
        assert_eq!(PoolSize::default().into_inner(), 20);
        assert_eq!(SyncTimeoutSecs::default().into_inner(), 30);
        assert_eq!(TurnDurationSecs::default().into_inner(), 60);
        assert_eq!(FastPathBudgetMs::default().into_inner(), 100);
        assert_eq!(HandlerTimeoutSecs::default().into_inner(), 30);
    }

    #[test]
    fn test_should_bound_config_scalars() {
        assert!(PoolSize::try_new(0).is_err());
        assert!(SyncTimeoutSecs::try_new(301).is_err());
        assert!(SyncTimeoutSecs::try_new(300).is_ok());
        assert!(FastPathBudgetMs::try_new(0).is_err());
    }
}
