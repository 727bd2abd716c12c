//! Shared fixtures for the Postgres-backed integration tests

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::sync::Arc;

use colloquy::{Coordinator, CoordinatorConfig};
use sqlx::PgPool;

/// Builds a coordinator over the test-provisioned pool. The DSN is unused
/// because `#[sqlx::test]` owns database setup and migrations.
pub fn coordinator(pool: PgPool) -> Arc<Coordinator> {
    let config = CoordinatorConfig::new("postgres://unused-with-injected-pool/test");
    Arc::new(Coordinator::with_pool(config, pool))
}

/// Registers the `acme` organization with agents alice, bob, and charlie
pub async fn register_acme(coordinator: &Coordinator) {
    coordinator
        .register_organization("acme", "Acme Corp")
        .await
        .expect("organization should register");
    for (external_id, name) in [("alice", "Alice"), ("bob", "Bob"), ("charlie", "Charlie")] {
        coordinator
            .register_agent(external_id, "acme", name)
            .await
            .expect("agent should register");
    }
}
