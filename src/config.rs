//! Coordinator configuration
//!
//! A single construction-time configuration value with validated scalars and
//! builder-style setters. Per-call timeouts are validated separately against
//! the documented 300-second ceiling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain_types::{
    FastPathBudgetMs, HandlerTimeoutSecs, PoolSize, SyncTimeoutSecs, TurnDurationSecs,
};
use crate::error::CoordinationError;

/// Hard ceiling on any synchronous wait
pub const MAX_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// Complete coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Connection string for the PostgreSQL store
    pub store_dsn: String,
    /// Store connection pool size
    pub pool_size: PoolSize,
    /// Timeout applied to `send_and_wait` when the caller passes none
    pub default_sync_timeout: SyncTimeoutSecs,
    /// Turn duration applied to `create_meeting` when the caller passes none
    pub default_turn_duration: TurnDurationSecs,
    /// Budget for the synchronous fast-path handler probe
    pub handler_fast_path_budget: FastPathBudgetMs,
    /// Upper bound on any single handler invocation
    pub handler_timeout: HandlerTimeoutSecs,
}

impl CoordinatorConfig {
    /// Creates a configuration with documented defaults for everything but
    /// the store DSN.
    #[must_use]
    pub fn new(store_dsn: impl Into<String>) -> Self {
        Self {
            store_dsn: store_dsn.into(),
            pool_size: PoolSize::default(),
            default_sync_timeout: SyncTimeoutSecs::default(),
            default_turn_duration: TurnDurationSecs::default(),
            handler_fast_path_budget: FastPathBudgetMs::default(),
            handler_timeout: HandlerTimeoutSecs::default(),
        }
    }

    /// Builder pattern: set pool size
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: PoolSize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Builder pattern: set the default synchronous timeout
    #[must_use]
    pub fn with_default_sync_timeout(mut self, timeout: SyncTimeoutSecs) -> Self {
        self.default_sync_timeout = timeout;
        self
    }

    /// Builder pattern: set the default meeting turn duration
    #[must_use]
    pub fn with_default_turn_duration(mut self, duration: TurnDurationSecs) -> Self {
        self.default_turn_duration = duration;
        self
    }

    /// Builder pattern: set the fast-path handler budget
    #[must_use]
    pub fn with_handler_fast_path_budget(mut self, budget: FastPathBudgetMs) -> Self {
        self.handler_fast_path_budget = budget;
        self
    }

    /// Builder pattern: set the handler invocation ceiling
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: HandlerTimeoutSecs) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Validates cross-field consistency of the configuration
    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.store_dsn.trim().is_empty() {
            return Err(CoordinationError::validation(
                "store_dsn",
                "connection string must not be empty",
            ));
        }
        Ok(())
    }
}

/// Validates a caller-supplied synchronous timeout: strictly positive and at
/// most [`MAX_SYNC_TIMEOUT`].
pub fn validate_sync_timeout(timeout: Duration) -> Result<Duration, CoordinationError> {
    if timeout.is_zero() {
        return Err(CoordinationError::validation(
            "timeout",
            "timeout must be greater than zero",
        ));
    }
    if timeout > MAX_SYNC_TIMEOUT {
        return Err(CoordinationError::validation(
            "timeout",
            format!(
                "timeout {:?} exceeds the {:?} ceiling",
                timeout, MAX_SYNC_TIMEOUT
            ),
        ));
    }
    Ok(timeout)
}

/// Validates a caller-supplied turn duration: strictly positive.
pub fn validate_turn_duration(duration: Duration) -> Result<Duration, CoordinationError> {
    if duration.is_zero() {
        return Err(CoordinationError::validation(
            "turn_duration",
            "turn duration must be greater than zero",
        ));
    }
    Ok(duration)
}
