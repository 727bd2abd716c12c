//! Coordinator facade
//!
//! Binds the store gateway, identity registry, handler registry, waiter
//! table, and the two engines into the four messaging patterns. Construction
//! opens the pool and applies migrations; `shutdown` stops every turn
//! scheduler, cancels every in-flight waiter with `Shutdown`, and drains the
//! pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, instrument};

use crate::config::CoordinatorConfig;
use crate::domain_types::{MeetingId, MessageId, SessionId};
use crate::error::{CoordinationError, CoordinationResult};
use crate::handlers::{HandlerKind, HandlerRegistry, MessageContext, MessageHandler};
use crate::identity::IdentityRegistry;
use crate::meeting::MeetingEngine;
use crate::models::{
    Agent, Meeting, MeetingEvent, MeetingParticipant, Message, MessageFilter, Organization,
    Session,
};
use crate::session::SessionEngine;
use crate::store::StoreGateway;
use crate::waiters::{CancelReason, WaiterTable};

/// The single construction entry point for the coordination kernel
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<StoreGateway>,
    handlers: Arc<HandlerRegistry>,
    waiters: Arc<WaiterTable>,
    identity: Arc<IdentityRegistry>,
    sessions: SessionEngine,
    meetings: MeetingEngine,
    shutdown: AtomicBool,
}

impl Coordinator {
    /// Opens the configured pool, applies embedded migrations, and wires the
    /// engines together.
    #[instrument(skip(config))]
    pub async fn connect(config: CoordinatorConfig) -> CoordinationResult<Self> {
        let store = Arc::new(StoreGateway::connect(&config).await?);
        info!("coordinator connected");
        Ok(Self::assemble(config, store))
    }

    /// Wires the engines over an already-open pool whose schema is managed by
    /// the caller (embedders sharing a pool, test harnesses).
    #[must_use]
    pub fn with_pool(config: CoordinatorConfig, pool: PgPool) -> Self {
        Self::assemble(config, Arc::new(StoreGateway::from_pool(pool)))
    }

    fn assemble(config: CoordinatorConfig, store: Arc<StoreGateway>) -> Self {
        let handlers = Arc::new(HandlerRegistry::new(config.handler_timeout.as_duration()));
        let waiters = Arc::new(WaiterTable::new());
        let identity = Arc::new(IdentityRegistry::new(store.clone()));
        let sessions = SessionEngine::new(
            store.clone(),
            handlers.clone(),
            waiters.clone(),
            identity.clone(),
            config.clone(),
        );
        let meetings = MeetingEngine::new(
            store.clone(),
            handlers.clone(),
            waiters.clone(),
            identity.clone(),
            config.clone(),
        );
        Self {
            config,
            store,
            handlers,
            waiters,
            identity,
            sessions,
            meetings,
            shutdown: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> CoordinationResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(CoordinationError::Shutdown);
        }
        Ok(())
    }

    /// Registers an organization (idempotent on its external id)
    pub async fn register_organization(
        &self,
        external_id: &str,
        name: &str,
    ) -> CoordinationResult<Organization> {
        self.ensure_running()?;
        self.identity.register_organization(external_id, name).await
    }

    /// Registers an agent under an existing organization
    pub async fn register_agent(
        &self,
        external_id: &str,
        org_external_id: &str,
        name: &str,
    ) -> CoordinationResult<Agent> {
        self.ensure_running()?;
        self.identity
            .register_agent(external_id, org_external_id, name)
            .await
    }

    /// Looks up an organization by external id
    pub async fn get_organization(
        &self,
        external_id: &str,
    ) -> CoordinationResult<Option<Organization>> {
        self.ensure_running()?;
        self.identity.get_organization(external_id).await
    }

    /// Looks up an agent by external id
    pub async fn get_agent(&self, external_id: &str) -> CoordinationResult<Option<Agent>> {
        self.ensure_running()?;
        self.identity.get_agent(external_id).await
    }

    /// Registers a handler for a kind; an existing registration is replaced
    pub fn register_handler(&self, kind: HandlerKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.register(kind, handler);
    }

    /// Registers a handler along with an opaque context value surfaced on
    /// every invocation
    pub fn register_handler_with_context(
        &self,
        kind: HandlerKind,
        handler: Arc<dyn MessageHandler>,
        context: Value,
    ) {
        self.handlers.register_with_context(kind, handler, context);
    }

    /// Registers a plain async closure as a handler
    pub fn register_handler_fn<F, Fut>(&self, kind: HandlerKind, callback: F)
    where
        F: Fn(Value, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        self.handlers.register_fn(kind, callback);
    }

    /// Whether a handler is registered for the kind
    #[must_use]
    pub fn has_handler(&self, kind: HandlerKind) -> bool {
        self.handlers.has(kind)
    }

    /// The one-way broadcast facade
    #[must_use]
    pub fn one_way(&self) -> OneWayApi<'_> {
        OneWayApi { coordinator: self }
    }

    /// The conversation (synchronous + asynchronous) facade
    #[must_use]
    pub fn conversation(&self) -> ConversationApi<'_> {
        ConversationApi { coordinator: self }
    }

    /// The meeting facade
    #[must_use]
    pub fn meeting(&self) -> MeetingApi<'_> {
        MeetingApi { coordinator: self }
    }

    /// Stops all turn schedulers, cancels every in-flight waiter with
    /// `Shutdown`, and drains the pool. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.meetings.shutdown();
        self.waiters.cancel_all(CancelReason::Shutdown);
        self.store.close().await;
        info!("coordinator shut down");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // Best-effort: scheduler tasks must not outlive the coordinator even
        // when shutdown() was never awaited. Pool drain needs an await and is
        // left to shutdown().
        if !self.shutdown.load(Ordering::SeqCst) {
            self.meetings.shutdown();
            self.waiters.cancel_all(CancelReason::Shutdown);
        }
    }
}

/// One-way broadcast operations
pub struct OneWayApi<'a> {
    coordinator: &'a Coordinator,
}

impl OneWayApi<'_> {
    /// Broadcasts `content` to each recipient; returns one message id per
    /// recipient. Requires a registered `OneWay` handler.
    pub async fn send(
        &self,
        sender_ext: &str,
        recipient_exts: &[&str],
        content: Value,
        metadata: Option<Value>,
    ) -> CoordinationResult<Vec<MessageId>> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .sessions
            .one_way_send(sender_ext, recipient_exts, content, metadata)
            .await
    }
}

/// Request/response and queued conversation operations
pub struct ConversationApi<'a> {
    coordinator: &'a Coordinator,
}

impl ConversationApi<'_> {
    /// Synchronous request/response; blocks until a reply or the timeout
    /// (default from configuration, hard cap 300 s)
    pub async fn send_and_wait(
        &self,
        sender_ext: &str,
        recipient_ext: &str,
        content: Value,
        timeout: Option<Duration>,
        metadata: Option<Value>,
    ) -> CoordinationResult<Message> {
        self.coordinator.ensure_running()?;
        let timeout =
            timeout.unwrap_or_else(|| self.coordinator.config.default_sync_timeout.as_duration());
        self.coordinator
            .sessions
            .send_and_wait(sender_ext, recipient_ext, content, timeout, metadata)
            .await
    }

    /// Queued send consumed on demand by the recipient
    pub async fn send_no_wait(
        &self,
        sender_ext: &str,
        recipient_ext: &str,
        content: Value,
        metadata: Option<Value>,
    ) -> CoordinationResult<MessageId> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .sessions
            .send_no_wait(sender_ext, recipient_ext, content, metadata)
            .await
    }

    /// Returns and consumes unread messages addressed to the agent
    pub async fn get_unread_messages(
        &self,
        agent_ext: &str,
        filter: Option<MessageFilter>,
    ) -> CoordinationResult<Vec<Message>> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .sessions
            .get_unread_messages(agent_ext, &filter.unwrap_or_default())
            .await
    }

    /// Full ordered message history of one session; does not mutate
    pub async fn get_messages_for_session(
        &self,
        session_id: SessionId,
        filter: Option<MessageFilter>,
    ) -> CoordinationResult<Vec<Message>> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .sessions
            .get_messages_for_session(session_id, &filter.unwrap_or_default())
            .await
    }

    /// The active session between two agents, if one exists
    pub async fn get_session(
        &self,
        agent_x_ext: &str,
        agent_y_ext: &str,
    ) -> CoordinationResult<Option<Session>> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .sessions
            .get_session(agent_x_ext, agent_y_ext)
            .await
    }

    /// Ends the active session between two agents
    pub async fn end_session(
        &self,
        initiator_ext: &str,
        peer_ext: &str,
    ) -> CoordinationResult<Session> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .sessions
            .end_session(initiator_ext, peer_ext)
            .await
    }
}

/// Turn-based meeting operations
pub struct MeetingApi<'a> {
    coordinator: &'a Coordinator,
}

impl MeetingApi<'_> {
    /// Creates a meeting hosted by `host_ext`; turn duration defaults from
    /// configuration
    pub async fn create(
        &self,
        host_ext: &str,
        turn_duration: Option<Duration>,
    ) -> CoordinationResult<Meeting> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .meetings
            .create_meeting(host_ext, turn_duration)
            .await
    }

    /// Adds an agent to the meeting roster
    pub async fn invite(
        &self,
        meeting_id: MeetingId,
        agent_ext: &str,
    ) -> CoordinationResult<MeetingParticipant> {
        self.coordinator.ensure_running()?;
        self.coordinator.meetings.invite(meeting_id, agent_ext).await
    }

    /// Joins an invited agent into the meeting
    pub async fn join(
        &self,
        meeting_id: MeetingId,
        agent_ext: &str,
    ) -> CoordinationResult<MeetingParticipant> {
        self.coordinator.ensure_running()?;
        self.coordinator.meetings.join(meeting_id, agent_ext).await
    }

    /// Starts a ready meeting (host only)
    pub async fn start(
        &self,
        meeting_id: MeetingId,
        host_ext: &str,
    ) -> CoordinationResult<Meeting> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .meetings
            .start_meeting(meeting_id, host_ext)
            .await
    }

    /// Sends a message into the meeting (current speaker only)
    pub async fn send(
        &self,
        sender_ext: &str,
        meeting_id: MeetingId,
        content: Value,
        metadata: Option<Value>,
    ) -> CoordinationResult<Message> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .meetings
            .meeting_send(sender_ext, meeting_id, content, metadata)
            .await
    }

    /// The current speaker cedes the floor
    pub async fn yield_turn(
        &self,
        meeting_id: MeetingId,
        agent_ext: &str,
    ) -> CoordinationResult<()> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .meetings
            .yield_turn(meeting_id, agent_ext)
            .await
    }

    /// Blocks the participant until it becomes the current speaker
    pub async fn await_turn(
        &self,
        meeting_id: MeetingId,
        agent_ext: &str,
        timeout: Option<Duration>,
    ) -> CoordinationResult<()> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .meetings
            .await_turn(meeting_id, agent_ext, timeout)
            .await
    }

    /// Leaves the meeting
    pub async fn leave(&self, meeting_id: MeetingId, agent_ext: &str) -> CoordinationResult<()> {
        self.coordinator.ensure_running()?;
        self.coordinator.meetings.leave(meeting_id, agent_ext).await
    }

    /// Ends the meeting (host only)
    pub async fn end(&self, meeting_id: MeetingId, host_ext: &str) -> CoordinationResult<Meeting> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .meetings
            .end_meeting(meeting_id, host_ext)
            .await
    }

    /// Looks up a meeting
    pub async fn get(&self, meeting_id: MeetingId) -> CoordinationResult<Meeting> {
        self.coordinator.ensure_running()?;
        self.coordinator.meetings.get_meeting(meeting_id).await
    }

    /// All participants of the meeting in rotation order
    pub async fn participants(
        &self,
        meeting_id: MeetingId,
    ) -> CoordinationResult<Vec<MeetingParticipant>> {
        self.coordinator.ensure_running()?;
        self.coordinator.meetings.get_participants(meeting_id).await
    }

    /// Full ordered message history of the meeting
    pub async fn messages(
        &self,
        meeting_id: MeetingId,
        filter: Option<MessageFilter>,
    ) -> CoordinationResult<Vec<Message>> {
        self.coordinator.ensure_running()?;
        self.coordinator
            .meetings
            .get_meeting_messages(meeting_id, &filter.unwrap_or_default())
            .await
    }

    /// The append-only event log of the meeting
    pub async fn events(&self, meeting_id: MeetingId) -> CoordinationResult<Vec<MeetingEvent>> {
        self.coordinator.ensure_running()?;
        self.coordinator.meetings.get_meeting_events(meeting_id).await
    }
}
