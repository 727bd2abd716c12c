//! Store gateway: typed operations against PostgreSQL
//!
//! The gateway owns the connection pool, runs embedded migrations, and
//! exposes the advisory-lock primitive the synchronous-wait and turn-rotation
//! protocols are built on.
//!
//! # Advisory-lock / connection coupling
//!
//! PostgreSQL advisory locks are held by a *session* (connection), so an
//! acquire and its matching release must happen on the same connection. The
//! gateway makes this a type-level requirement: [`StoreGateway::try_advisory_lock`]
//! returns an [`AdvisoryLockGuard`] that owns the pinned pool connection for
//! the lifetime of the lock, and the unlock always runs on that connection —
//! either in [`AdvisoryLockGuard::release`] or, if the guard is dropped by a
//! cancelled task, in a spawned best-effort unlock before the connection
//! returns to the pool.

pub mod identity;
pub mod meetings;
pub mod messages;
pub mod sessions;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::CoordinationError;

/// Static migrator for the embedded schema migrations
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Advisory-lock key derived from an entity UUID.
///
/// The key is the first 8 bytes of the UUID interpreted as a big-endian
/// 64-bit integer with the sign bit masked off, so it always fits Postgres's
/// signed `bigint` key space. Session locks and meeting locks share the key
/// space; collisions are statistically negligible and merely conservative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(i64);

impl LockKey {
    /// Derives the lock key for an entity id
    #[must_use]
    pub fn for_entity(id: Uuid) -> Self {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&id.as_bytes()[..8]);
        let masked = u64::from_be_bytes(prefix) & 0x7FFF_FFFF_FFFF_FFFF;
        Self(masked as i64)
    }

    /// The key as the `bigint` Postgres expects
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

/// A held advisory lock pinned to one pool connection.
///
/// Dropping the guard without calling [`release`](Self::release) spawns a
/// best-effort unlock on the owning connection so a cancelled caller cannot
/// leak the lock into an unrelated pool checkout.
pub struct AdvisoryLockGuard {
    conn: Option<PoolConnection<Postgres>>,
    key: LockKey,
}

impl AdvisoryLockGuard {
    /// Releases the lock on the pinned connection and returns it to the pool
    pub async fn release(mut self) -> Result<(), CoordinationError> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.key.as_i64())
                .execute(&mut *conn)
                .await?;
            debug!(key = self.key.as_i64(), "released advisory lock");
        }
        Ok(())
    }
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let key = self.key;
            tokio::spawn(async move {
                if let Err(error) = sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(key.as_i64())
                    .execute(&mut *conn)
                    .await
                {
                    warn!(key = key.as_i64(), %error, "failed to release advisory lock on drop");
                }
            });
        }
    }
}

/// Typed gateway over the PostgreSQL pool
#[derive(Clone)]
pub struct StoreGateway {
    pool: PgPool,
}

impl StoreGateway {
    /// Opens the pool described by the configuration and applies embedded
    /// migrations.
    #[instrument(skip(config), fields(pool_size = %config.pool_size))]
    pub async fn connect(config: &CoordinatorConfig) -> Result<Self, CoordinationError> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size.into_inner())
            .connect(&config.store_dsn)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Wraps an already-open pool whose schema is managed by the caller.
    ///
    /// Useful for embedders that share a pool, and for test harnesses that
    /// provision databases themselves.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for read paths and single-statement writes
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begins a transaction on a pool connection. Dropping the returned
    /// transaction without committing rolls it back.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, CoordinationError> {
        Ok(self.pool.begin().await?)
    }

    /// Attempts to take the advisory lock for `key` on a freshly pinned
    /// connection. Returns `None` when the lock is already held elsewhere.
    pub async fn try_advisory_lock(
        &self,
        key: LockKey,
    ) -> Result<Option<AdvisoryLockGuard>, CoordinationError> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key.as_i64())
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            debug!(key = key.as_i64(), "acquired advisory lock");
            Ok(Some(AdvisoryLockGuard {
                conn: Some(conn),
                key,
            }))
        } else {
            Ok(None)
        }
    }

    /// Closes the pool, waiting for checked-out connections to return
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_should_derive_lock_key_from_uuid_prefix_big_endian() {
        let id = Uuid::from_bytes([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, //
            0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11,
        ]);
        assert_eq!(LockKey::for_entity(id).as_i64(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_should_mask_sign_bit_of_lock_key() {
        let id = Uuid::from_bytes([0xFF; 16]);
        assert_eq!(LockKey::for_entity(id).as_i64(), 0x7FFF_FFFF_FFFF_FFFF);
    }

    proptest! {
        #[test]
        fn prop_lock_keys_are_never_negative(raw in any::<u128>()) {
            let key = LockKey::for_entity(Uuid::from_u128(raw));
            prop_assert!(key.as_i64() >= 0);
        }
    }
}
