//! # Colloquy — a coordination kernel for AI agents
//!
//! Agents identified by stable external ids, grouped under organizations,
//! communicate through four patterns over a shared PostgreSQL store:
//!
//! - **One-way broadcasts**: fire-and-forget delivery to many recipients
//! - **Synchronous conversations**: the sender blocks until a response or
//!   timeout, serialised per session by a store advisory lock
//! - **Asynchronous conversations**: queued messages consumed on demand
//! - **Meetings**: multi-agent rooms with turn-based speaking and a
//!   per-meeting scheduler task
//!
//! All durable state (agents, sessions, meetings, messages, events) lives in
//! the store; the in-process waiter table only coordinates currently-blocked
//! callers and is intentionally lost on restart.
//!
//! ## Example
//!
//! ```rust,no_run
//! use colloquy::{Coordinator, CoordinatorConfig, HandlerKind};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoordinatorConfig::new("postgres://localhost/agents");
//! let coordinator = Coordinator::connect(config).await?;
//!
//! coordinator.register_organization("acme", "Acme Corp").await?;
//! coordinator.register_agent("alice", "acme", "Alice").await?;
//! coordinator.register_agent("bob", "acme", "Bob").await?;
//!
//! coordinator.register_handler_fn(HandlerKind::Conversation, |content, _ctx| async move {
//!     Ok(Some(json!({ "echo": content })))
//! });
//!
//! let reply = coordinator
//!     .conversation()
//!     .send_and_wait("alice", "bob", json!({ "q": "ping" }), None, None)
//!     .await?;
//! println!("bob replied: {}", reply.content);
//!
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod domain_types;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod meeting;
pub mod models;
pub mod observability;
pub mod session;
pub mod store;
pub mod waiters;

pub use config::{CoordinatorConfig, MAX_SYNC_TIMEOUT};
pub use coordinator::{ConversationApi, Coordinator, MeetingApi, OneWayApi};
pub use domain_types::{
    AgentId, EventId, ExternalId, FastPathBudgetMs, HandlerTimeoutSecs, MeetingId, MessageId,
    OrganizationId, PoolSize, SessionId, SyncTimeoutSecs, TurnDurationSecs,
};
pub use error::{CoordinationError, CoordinationResult};
pub use handlers::{
    Dispatch, DispatchOutcome, HandlerKind, HandlerRegistry, MessageContext, MessageHandler,
};
pub use identity::IdentityRegistry;
pub use meeting::MeetingEngine;
pub use models::{
    Agent, Meeting, MeetingEvent, MeetingEventType, MeetingParticipant, MeetingStatus, Message,
    MessageFilter, MessageType, Organization, ParticipantStatus, Session, SessionStatus,
};
pub use session::SessionEngine;
pub use store::{AdvisoryLockGuard, LockKey, StoreGateway};
pub use waiters::{CancelReason, WaitOutcome, WaiterKey, WaiterTable};
