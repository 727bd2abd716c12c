//! Session engine: one-way sends, synchronous and asynchronous conversations
//!
//! The synchronous path (`send_and_wait`) establishes three things together
//! and tears them down together on every exit path, including cancellation:
//! the durable `locked_agent_id` column, the session's advisory lock on a
//! pinned connection, and the in-process waiter entry. The advisory lock
//! serialises synchronous exchanges across processes; the waiter entry is the
//! in-process slot a reply is handed into; `locked_agent_id` is what a remote
//! `send_no_wait` reads to decide whether to raise an out-of-band
//! notification.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{CoordinatorConfig, validate_sync_timeout};
use crate::domain_types::{AgentId, MessageId, SessionId};
use crate::error::{CoordinationError, CoordinationResult};
use crate::handlers::{HandlerKind, HandlerRegistry, MessageContext, PendingDispatch};
use crate::identity::IdentityRegistry;
use crate::models::{Agent, Message, MessageFilter, MessageType, Session};
use crate::store::messages::NewMessage;
use crate::store::{AdvisoryLockGuard, LockKey, StoreGateway, messages, sessions};
use crate::waiters::{CancelReason, WaitOutcome, WaiterKey, WaiterTable};

/// Engine behind the one-way and conversation facades
pub struct SessionEngine {
    store: Arc<StoreGateway>,
    handlers: Arc<HandlerRegistry>,
    waiters: Arc<WaiterTable>,
    identity: Arc<IdentityRegistry>,
    config: CoordinatorConfig,
}

impl SessionEngine {
    pub(crate) fn new(
        store: Arc<StoreGateway>,
        handlers: Arc<HandlerRegistry>,
        waiters: Arc<WaiterTable>,
        identity: Arc<IdentityRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            waiters,
            identity,
            config,
        }
    }

    /// Sends `content` to each recipient in its own independent transaction
    /// and fires the `OneWay` handler per delivery. One-way messages carry no
    /// session.
    #[instrument(skip(self, content, metadata), fields(sender = sender_ext))]
    pub async fn one_way_send(
        &self,
        sender_ext: &str,
        recipient_exts: &[&str],
        content: Value,
        metadata: Option<Value>,
    ) -> CoordinationResult<Vec<MessageId>> {
        if recipient_exts.is_empty() {
            return Err(CoordinationError::validation(
                "recipients",
                "at least one recipient is required",
            ));
        }
        if !self.handlers.has(HandlerKind::OneWay) {
            return Err(CoordinationError::NoHandler {
                kind: HandlerKind::OneWay,
            });
        }
        let sender = self.identity.resolve_agent("sender", sender_ext).await?;

        let mut message_ids = Vec::with_capacity(recipient_exts.len());
        for recipient_ext in recipient_exts {
            let recipient = self.identity.resolve_agent("recipient", recipient_ext).await?;
            let message = messages::insert_message(
                self.store.pool(),
                NewMessage {
                    sender_id: sender.id,
                    recipient_id: Some(recipient.id),
                    session_id: None,
                    meeting_id: None,
                    message_type: MessageType::UserDefined,
                    content: &content,
                    metadata: metadata.as_ref(),
                    read_at: None,
                },
            )
            .await?;
            let ctx = MessageContext {
                sender_id: sender.id,
                receiver_id: recipient.id,
                organization_id: recipient.organization_id,
                handler_context: Value::Null,
                message_id: Some(message.id),
                session_id: None,
                meeting_id: None,
                metadata: metadata.clone(),
            };
            self.handlers
                .dispatch_detached(HandlerKind::OneWay, content.clone(), ctx);
            message_ids.push(message.id);
        }
        info!(count = message_ids.len(), "broadcast persisted");
        Ok(message_ids)
    }

    /// Synchronous request/response: persists the request, probes the
    /// conversation handler on a short budget, then parks the sender on a
    /// waiter until a reply arrives or `timeout` elapses.
    #[instrument(
        skip(self, content, metadata),
        fields(sender = sender_ext, recipient = recipient_ext)
    )]
    pub async fn send_and_wait(
        &self,
        sender_ext: &str,
        recipient_ext: &str,
        content: Value,
        timeout: Duration,
        metadata: Option<Value>,
    ) -> CoordinationResult<Message> {
        let timeout = validate_sync_timeout(timeout)?;
        if !self.handlers.has(HandlerKind::Conversation) {
            return Err(CoordinationError::NoHandler {
                kind: HandlerKind::Conversation,
            });
        }
        let sender = self.identity.resolve_agent("sender", sender_ext).await?;
        let recipient = self.identity.resolve_agent("recipient", recipient_ext).await?;
        if sender.id == recipient.id {
            return Err(CoordinationError::validation(
                "recipient",
                "an agent cannot open a session with itself",
            ));
        }

        let session = {
            let mut tx = self.store.begin().await?;
            let session = sessions::resolve_or_create(&mut tx, sender.id, recipient.id).await?;
            tx.commit().await?;
            session
        };

        let lock = self
            .store
            .try_advisory_lock(LockKey::for_entity(session.id.into_inner()))
            .await?
            .ok_or(CoordinationError::SessionBusy {
                session_id: session.id,
            })?;

        let waiter_key = WaiterKey::session(session.id, sender.id);
        let Some(handle) = self.waiters.register(waiter_key) else {
            if let Err(error) = lock.release().await {
                warn!(%error, session_id = %session.id, "failed to release session advisory lock");
            }
            return Err(CoordinationError::SessionLockConflict {
                session_id: session.id,
                agent_id: sender.id,
            });
        };

        let guard = SyncWaitGuard {
            store: self.store.clone(),
            waiters: self.waiters.clone(),
            session_id: session.id,
            key: waiter_key,
            lock: Some(lock),
            armed: true,
        };
        let result = self
            .locked_exchange(&sender, &recipient, &session, content, metadata, timeout, handle)
            .await;
        guard.finish().await;
        result
    }

    async fn locked_exchange(
        &self,
        sender: &Agent,
        recipient: &Agent,
        session: &Session,
        content: Value,
        metadata: Option<Value>,
        timeout: Duration,
        handle: crate::waiters::WaiterHandle,
    ) -> CoordinationResult<Message> {
        let deadline = Instant::now() + timeout;

        let request = {
            let mut tx = self.store.begin().await?;
            sessions::set_locked_agent(&mut *tx, session.id, sender.id).await?;
            let request = messages::insert_message(
                &mut *tx,
                NewMessage {
                    sender_id: sender.id,
                    recipient_id: Some(recipient.id),
                    session_id: Some(session.id),
                    meeting_id: None,
                    message_type: MessageType::UserDefined,
                    content: &content,
                    metadata: metadata.as_ref(),
                    read_at: None,
                },
            )
            .await?;
            tx.commit().await?;
            request
        };

        let ctx = MessageContext {
            sender_id: sender.id,
            receiver_id: recipient.id,
            organization_id: recipient.organization_id,
            handler_context: Value::Null,
            message_id: Some(request.id),
            session_id: Some(session.id),
            meeting_id: None,
            metadata: metadata.clone(),
        };

        // Fast path: a short budgeted probe of the conversation handler.
        if let Some(pending) = self
            .handlers
            .begin(HandlerKind::Conversation, content.clone(), ctx)
        {
            match pending
                .wait_budget(self.config.handler_fast_path_budget.as_duration())
                .await
            {
                Ok(dispatch) => {
                    if let Some(payload) = dispatch.response {
                        return self
                            .finalize_fast_path(session, sender, recipient, request.id, &payload)
                            .await;
                    }
                    debug!(outcome = ?dispatch.outcome, "fast path produced no response");
                }
                Err(pending) => {
                    // The handler is still running; its eventual return is
                    // persisted and delivered through the waiter table.
                    self.spawn_reply_completion(pending, session.id, sender.id, recipient.id);
                }
            }
        }

        // A concurrent send_no_wait from the recipient may already have
        // replied before our waiter was consulted.
        if let Some(reply) =
            messages::find_unread_reply(self.store.pool(), session.id, recipient.id, sender.id)
                .await?
        {
            return self.finalize_reply(request.id, reply).await;
        }

        match self.waiters.wait(handle, deadline).await {
            WaitOutcome::Delivered(Some(reply)) => self.finalize_reply(request.id, reply).await,
            WaitOutcome::Delivered(None) => {
                // Signalled without an attached payload; the reply must be in
                // the store.
                match messages::find_unread_reply(
                    self.store.pool(),
                    session.id,
                    recipient.id,
                    sender.id,
                )
                .await?
                {
                    Some(reply) => self.finalize_reply(request.id, reply).await,
                    None => Err(CoordinationError::Timeout { waited: timeout }),
                }
            }
            WaitOutcome::TimedOut => {
                let note = json!({ "timed_out_after_secs": timeout.as_secs_f64() });
                if let Err(error) = messages::insert_message(
                    self.store.pool(),
                    NewMessage {
                        sender_id: recipient.id,
                        recipient_id: Some(sender.id),
                        session_id: Some(session.id),
                        meeting_id: None,
                        message_type: MessageType::Timeout,
                        content: &note,
                        metadata: None,
                        read_at: None,
                    },
                )
                .await
                {
                    warn!(%error, session_id = %session.id, "failed to persist timeout marker");
                }
                Err(CoordinationError::Timeout { waited: timeout })
            }
            WaitOutcome::Cancelled(CancelReason::Shutdown) => Err(CoordinationError::Shutdown),
            WaitOutcome::Cancelled(_) => Err(CoordinationError::SessionEnded {
                session_id: session.id,
            }),
        }
    }

    /// Persists the fast-path reply and marks the whole exchange read
    async fn finalize_fast_path(
        &self,
        session: &Session,
        sender: &Agent,
        recipient: &Agent,
        request_id: MessageId,
        payload: &Value,
    ) -> CoordinationResult<Message> {
        let mut tx = self.store.begin().await?;
        let reply = messages::insert_message(
            &mut *tx,
            NewMessage {
                sender_id: recipient.id,
                recipient_id: Some(sender.id),
                session_id: Some(session.id),
                meeting_id: None,
                message_type: MessageType::UserDefined,
                content: payload,
                metadata: None,
                read_at: Some(chrono::Utc::now()),
            },
        )
        .await?;
        messages::mark_read(&mut *tx, &[request_id]).await?;
        tx.commit().await?;
        debug!(session_id = %session.id, "fast path completed the exchange");
        Ok(reply)
    }

    /// Marks a delivered reply (and the request it answers) read
    async fn finalize_reply(
        &self,
        request_id: MessageId,
        reply: Message,
    ) -> CoordinationResult<Message> {
        messages::mark_read(self.store.pool(), &[request_id]).await?;
        Ok(messages::mark_read_returning(self.store.pool(), reply.id)
            .await?
            .unwrap_or(reply))
    }

    fn spawn_reply_completion(
        &self,
        pending: PendingDispatch,
        session_id: SessionId,
        original_sender: AgentId,
        original_recipient: AgentId,
    ) {
        let store = self.store.clone();
        let waiters = self.waiters.clone();
        tokio::spawn(async move {
            let dispatch = pending.wait().await;
            let Some(payload) = dispatch.response else {
                return;
            };
            if let Err(error) = deliver_reply(
                &store,
                &waiters,
                session_id,
                original_sender,
                original_recipient,
                &payload,
            )
            .await
            {
                warn!(%error, %session_id, "failed to deliver late handler reply");
            }
        });
    }

    /// Asynchronous send: persists the message under the session, hands it
    /// directly to a blocked recipient if one is waiting, otherwise schedules
    /// the conversation handler; raises the out-of-band notification unless
    /// the recipient is the currently locked agent.
    #[instrument(
        skip(self, content, metadata),
        fields(sender = sender_ext, recipient = recipient_ext)
    )]
    pub async fn send_no_wait(
        &self,
        sender_ext: &str,
        recipient_ext: &str,
        content: Value,
        metadata: Option<Value>,
    ) -> CoordinationResult<MessageId> {
        if !self.handlers.has(HandlerKind::Conversation) {
            return Err(CoordinationError::NoHandler {
                kind: HandlerKind::Conversation,
            });
        }
        let sender = self.identity.resolve_agent("sender", sender_ext).await?;
        let recipient = self.identity.resolve_agent("recipient", recipient_ext).await?;
        if sender.id == recipient.id {
            return Err(CoordinationError::validation(
                "recipient",
                "an agent cannot open a session with itself",
            ));
        }

        let (session, message) = {
            let mut tx = self.store.begin().await?;
            let session = sessions::resolve_or_create(&mut tx, sender.id, recipient.id).await?;
            let message = messages::insert_message(
                &mut *tx,
                NewMessage {
                    sender_id: sender.id,
                    recipient_id: Some(recipient.id),
                    session_id: Some(session.id),
                    meeting_id: None,
                    message_type: MessageType::UserDefined,
                    content: &content,
                    metadata: metadata.as_ref(),
                    read_at: None,
                },
            )
            .await?;
            tx.commit().await?;
            (session, message)
        };

        let recipient_key = WaiterKey::session(session.id, recipient.id);
        if self.waiters.deliver(&recipient_key, message.clone()) {
            // A waiting recipient got the message handed over directly; it is
            // by definition the locked agent, so no notification either.
            debug!(session_id = %session.id, "handed message directly to blocked recipient");
            return Ok(message.id);
        }

        let ctx = MessageContext {
            sender_id: sender.id,
            receiver_id: recipient.id,
            organization_id: recipient.organization_id,
            handler_context: Value::Null,
            message_id: Some(message.id),
            session_id: Some(session.id),
            meeting_id: None,
            metadata: metadata.clone(),
        };
        if let Some(pending) =
            self.handlers
                .begin(HandlerKind::Conversation, content.clone(), ctx.clone())
        {
            self.spawn_reply_completion(pending, session.id, sender.id, recipient.id);
        }

        // Notification rule: the durable locked_agent_id decides, so an agent
        // blocked in another process counts too.
        let locked_agent = sessions::fetch_session_by_id(self.store.pool(), session.id)
            .await?
            .and_then(|current| current.locked_agent_id);
        if locked_agent != Some(recipient.id) {
            self.handlers
                .dispatch_detached(HandlerKind::MessageNotification, content, ctx);
        }

        Ok(message.id)
    }

    /// Returns and consumes unread messages addressed to the agent
    pub async fn get_unread_messages(
        &self,
        agent_ext: &str,
        filter: &MessageFilter,
    ) -> CoordinationResult<Vec<Message>> {
        let agent = self.identity.resolve_agent("agent", agent_ext).await?;
        messages::consume_unread(self.store.pool(), agent.id, filter).await
    }

    /// Full ordered message history of one session; does not mutate
    pub async fn get_messages_for_session(
        &self,
        session_id: SessionId,
        filter: &MessageFilter,
    ) -> CoordinationResult<Vec<Message>> {
        if sessions::fetch_session_by_id(self.store.pool(), session_id)
            .await?
            .is_none()
        {
            return Err(CoordinationError::not_found("session", session_id.to_string()));
        }
        messages::fetch_session_messages(self.store.pool(), session_id, filter).await
    }

    /// The active session between two agents, if one exists
    pub async fn get_session(
        &self,
        agent_x_ext: &str,
        agent_y_ext: &str,
    ) -> CoordinationResult<Option<Session>> {
        let x = self.identity.resolve_agent("agent", agent_x_ext).await?;
        let y = self.identity.resolve_agent("agent", agent_y_ext).await?;
        sessions::fetch_active_session(self.store.pool(), x.id, y.id).await
    }

    /// Ends the active session between two agents. Any caller blocked in
    /// `send_and_wait` on it fails with `SessionEnded`.
    #[instrument(skip(self), fields(initiator = initiator_ext, peer = peer_ext))]
    pub async fn end_session(
        &self,
        initiator_ext: &str,
        peer_ext: &str,
    ) -> CoordinationResult<Session> {
        let initiator = self.identity.resolve_agent("initiator", initiator_ext).await?;
        let peer = self.identity.resolve_agent("peer", peer_ext).await?;
        let session = sessions::fetch_active_session(self.store.pool(), initiator.id, peer.id)
            .await?
            .ok_or_else(|| {
                CoordinationError::not_found("session", format!("{initiator_ext}/{peer_ext}"))
            })?;

        let ended = {
            let mut tx = self.store.begin().await?;
            let Some(ended) = sessions::end_session(&mut *tx, session.id).await? else {
                return Err(CoordinationError::SessionEnded {
                    session_id: session.id,
                });
            };
            let note = json!({ "reason": "session_ended" });
            messages::insert_message(
                &mut *tx,
                NewMessage {
                    sender_id: initiator.id,
                    recipient_id: Some(peer.id),
                    session_id: Some(session.id),
                    meeting_id: None,
                    message_type: MessageType::Ending,
                    content: &note,
                    metadata: None,
                    read_at: None,
                },
            )
            .await?;
            tx.commit().await?;
            ended
        };

        self.waiters
            .cancel_scope(session.id.into_inner(), CancelReason::SessionEnded);
        info!(session_id = %session.id, "session ended");
        Ok(ended)
    }
}

/// Persists a handler's reply and hands it to the blocked original sender.
/// When the sender is no longer waiting the reply simply stays unread.
async fn deliver_reply(
    store: &StoreGateway,
    waiters: &WaiterTable,
    session_id: SessionId,
    original_sender: AgentId,
    original_recipient: AgentId,
    payload: &Value,
) -> CoordinationResult<()> {
    let reply = messages::insert_message(
        store.pool(),
        NewMessage {
            sender_id: original_recipient,
            recipient_id: Some(original_sender),
            session_id: Some(session_id),
            meeting_id: None,
            message_type: MessageType::UserDefined,
            content: payload,
            metadata: None,
            read_at: None,
        },
    )
    .await?;
    let key = WaiterKey::session(session_id, original_sender);
    if !waiters.deliver(&key, reply) {
        debug!(%session_id, "original sender no longer waiting; reply left unread");
    }
    Ok(())
}

/// Teardown envelope for one synchronous wait.
///
/// The normal path calls [`finish`](Self::finish); if the owning task is
/// cancelled mid-wait, `Drop` spawns the same teardown so the waiter entry,
/// the durable `locked_agent_id`, and the advisory lock can never outlive the
/// call.
struct SyncWaitGuard {
    store: Arc<StoreGateway>,
    waiters: Arc<WaiterTable>,
    session_id: SessionId,
    key: WaiterKey,
    lock: Option<AdvisoryLockGuard>,
    armed: bool,
}

impl SyncWaitGuard {
    async fn finish(mut self) {
        self.armed = false;
        self.waiters.remove(&self.key);
        if let Err(error) = sessions::clear_locked_agent(self.store.pool(), self.session_id).await {
            warn!(%error, session_id = %self.session_id, "failed to clear locked_agent_id");
        }
        if let Some(lock) = self.lock.take() {
            if let Err(error) = lock.release().await {
                warn!(%error, session_id = %self.session_id, "failed to release session advisory lock");
            }
        }
    }
}

impl Drop for SyncWaitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.waiters.remove(&self.key);
        let store = self.store.clone();
        let session_id = self.session_id;
        let lock = self.lock.take();
        tokio::spawn(async move {
            if let Err(error) = sessions::clear_locked_agent(store.pool(), session_id).await {
                warn!(%error, %session_id, "failed to clear locked_agent_id during cancellation");
            }
            if let Some(lock) = lock {
                if let Err(error) = lock.release().await {
                    warn!(%error, %session_id, "failed to release session advisory lock during cancellation");
                }
            }
        });
    }
}
