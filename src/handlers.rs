//! Process-wide handler registry and dispatch policy
//!
//! At most one callback is registered per [`HandlerKind`]; a later
//! registration replaces the earlier one. Per-agent routing happens inside a
//! handler by inspecting [`MessageContext::receiver_id`].
//!
//! Dispatch never propagates handler failures to the sender: errors and
//! panics are logged and reported as an [`DispatchOutcome::Errored`] outcome,
//! and every invocation is capped by the configured handler timeout. The
//! synchronous send path uses [`HandlerRegistry::begin`] +
//! [`PendingDispatch::wait_budget`] so a probe that exhausts its budget
//! leaves the invocation running and a late return can still be delivered.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain_types::{AgentId, MeetingId, MessageId, OrganizationId, SessionId};
use crate::models::MeetingEventType;

/// The registerable callback kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Receives one-way broadcast messages
    OneWay,
    /// Receives session messages (synchronous and asynchronous)
    Conversation,
    /// Receives meeting messages fanned out to attendees
    Meeting,
    /// Out-of-band alert that an unread message arrived for a non-waiting agent
    MessageNotification,
    /// Meeting event: the host started the meeting
    MeetingStarted,
    /// Meeting event: the speaking turn rotated
    TurnChanged,
    /// Meeting event: the meeting ended
    MeetingEnded,
    /// Meeting event: a participant joined
    ParticipantJoined,
    /// Meeting event: a participant left
    ParticipantLeft,
    /// Meeting event: a speaker's turn elapsed without a yield
    TurnTimeout,
}

impl HandlerKind {
    /// Stable name of the kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneWay => "one_way",
            Self::Conversation => "conversation",
            Self::Meeting => "meeting",
            Self::MessageNotification => "message_notification",
            Self::MeetingStarted => "meeting_started",
            Self::TurnChanged => "turn_changed",
            Self::MeetingEnded => "meeting_ended",
            Self::ParticipantJoined => "participant_joined",
            Self::ParticipantLeft => "participant_left",
            Self::TurnTimeout => "turn_timeout",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MeetingEventType> for HandlerKind {
    fn from(event_type: MeetingEventType) -> Self {
        match event_type {
            MeetingEventType::MeetingStarted => Self::MeetingStarted,
            MeetingEventType::TurnChanged => Self::TurnChanged,
            MeetingEventType::MeetingEnded => Self::MeetingEnded,
            MeetingEventType::ParticipantJoined => Self::ParticipantJoined,
            MeetingEventType::ParticipantLeft => Self::ParticipantLeft,
            MeetingEventType::TurnTimeout => Self::TurnTimeout,
        }
    }
}

/// Context passed to every handler invocation
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Agent the message originates from
    pub sender_id: AgentId,
    /// Agent this invocation acts on behalf of
    pub receiver_id: AgentId,
    /// Organization of the receiving agent
    pub organization_id: OrganizationId,
    /// Opaque value supplied when the handler was registered
    pub handler_context: Value,
    /// The persisted message, when the dispatch concerns one
    pub message_id: Option<MessageId>,
    /// Owning session, for session messages
    pub session_id: Option<SessionId>,
    /// Owning meeting, for meeting messages and events
    pub meeting_id: Option<MeetingId>,
    /// Caller metadata attached to the message
    pub metadata: Option<Value>,
}

/// A registered callback.
///
/// Returning `Ok(None)` means "no synchronous response"; returning
/// `Ok(Some(value))` hands the engine a reply payload to persist and deliver.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message
    async fn handle(&self, content: Value, ctx: MessageContext) -> anyhow::Result<Option<Value>>;
}

struct FnHandler<F> {
    callback: F,
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Value, MessageContext) -> BoxFuture<'static, anyhow::Result<Option<Value>>>
        + Send
        + Sync,
{
    async fn handle(&self, content: Value, ctx: MessageContext) -> anyhow::Result<Option<Value>> {
        (self.callback)(content, ctx).await
    }
}

/// How a dispatch concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran to completion (its return value may still be `None`)
    Returned,
    /// The handler exceeded the invocation ceiling
    TimedOut,
    /// The handler returned an error or panicked
    Errored,
    /// No handler is registered for the kind
    NoHandler,
}

/// Result of one dispatch
#[derive(Debug)]
pub struct Dispatch {
    /// The handler's return value, when it produced one
    pub response: Option<Value>,
    /// How the dispatch concluded
    pub outcome: DispatchOutcome,
}

impl Dispatch {
    fn no_handler() -> Self {
        Self {
            response: None,
            outcome: DispatchOutcome::NoHandler,
        }
    }
}

/// An in-flight handler invocation.
///
/// The invocation runs as its own task, so abandoning the budgeted wait does
/// not cancel the handler.
pub struct PendingDispatch {
    kind: HandlerKind,
    handle: JoinHandle<Dispatch>,
}

impl PendingDispatch {
    /// Waits for the invocation to conclude
    pub async fn wait(self) -> Dispatch {
        match self.handle.await {
            Ok(dispatch) => dispatch,
            Err(join_error) => {
                warn!(kind = %self.kind, %join_error, "handler task failed");
                Dispatch {
                    response: None,
                    outcome: DispatchOutcome::Errored,
                }
            }
        }
    }

    /// Waits up to `budget` for the invocation to conclude. On budget
    /// exhaustion the invocation keeps running and `self` is handed back.
    pub async fn wait_budget(mut self, budget: Duration) -> Result<Dispatch, PendingDispatch> {
        match tokio::time::timeout(budget, &mut self.handle).await {
            Ok(Ok(dispatch)) => Ok(dispatch),
            Ok(Err(join_error)) => {
                warn!(kind = %self.kind, %join_error, "handler task failed");
                Ok(Dispatch {
                    response: None,
                    outcome: DispatchOutcome::Errored,
                })
            }
            Err(_) => Err(self),
        }
    }
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn MessageHandler>,
    context: Value,
}

/// Process-wide mapping from handler kind to its single registered callback
pub struct HandlerRegistry {
    handlers: DashMap<HandlerKind, Registration>,
    handler_timeout: Duration,
}

impl HandlerRegistry {
    /// Creates a registry whose invocations are capped by `handler_timeout`
    #[must_use]
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            handlers: DashMap::new(),
            handler_timeout,
        }
    }

    /// Registers a handler for a kind; an existing registration is replaced
    pub fn register(&self, kind: HandlerKind, handler: Arc<dyn MessageHandler>) {
        self.register_with_context(kind, handler, Value::Null);
    }

    /// Registers a handler together with an opaque context value that is
    /// surfaced as [`MessageContext::handler_context`] on every invocation
    pub fn register_with_context(
        &self,
        kind: HandlerKind,
        handler: Arc<dyn MessageHandler>,
        context: Value,
    ) {
        if self.handlers.insert(kind, Registration { handler, context }).is_some() {
            debug!(%kind, "replaced existing handler registration");
        }
    }

    /// Registers a plain async closure as a handler
    pub fn register_fn<F, Fut>(&self, kind: HandlerKind, callback: F)
    where
        F: Fn(Value, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        let wrapped = move |content: Value,
                            ctx: MessageContext|
              -> BoxFuture<'static, anyhow::Result<Option<Value>>> {
            Box::pin(callback(content, ctx))
        };
        self.register(kind, Arc::new(FnHandler { callback: wrapped }));
    }

    /// Whether a handler is registered for the kind
    #[must_use]
    pub fn has(&self, kind: HandlerKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Starts an invocation as its own task. Returns `None` when no handler
    /// is registered for the kind.
    pub fn begin(
        &self,
        kind: HandlerKind,
        content: Value,
        mut ctx: MessageContext,
    ) -> Option<PendingDispatch> {
        let registration = self.handlers.get(&kind)?.value().clone();
        let ceiling = self.handler_timeout;
        ctx.handler_context = registration.context.clone();
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(ceiling, registration.handler.handle(content, ctx)).await {
                Ok(Ok(response)) => Dispatch {
                    response,
                    outcome: DispatchOutcome::Returned,
                },
                Ok(Err(error)) => {
                    warn!(kind = %kind, %error, "handler returned an error");
                    Dispatch {
                        response: None,
                        outcome: DispatchOutcome::Errored,
                    }
                }
                Err(_) => {
                    warn!(kind = %kind, ceiling = ?ceiling, "handler exceeded invocation ceiling");
                    Dispatch {
                        response: None,
                        outcome: DispatchOutcome::TimedOut,
                    }
                }
            }
        });
        Some(PendingDispatch { kind, handle })
    }

    /// Runs one invocation to completion
    pub async fn dispatch(&self, kind: HandlerKind, content: Value, ctx: MessageContext) -> Dispatch {
        match self.begin(kind, content, ctx) {
            Some(pending) => pending.wait().await,
            None => Dispatch::no_handler(),
        }
    }

    /// Fire-and-forget dispatch: the caller does not observe completion
    pub fn dispatch_detached(&self, kind: HandlerKind, content: Value, ctx: MessageContext) {
        if let Some(pending) = self.begin(kind, content, ctx) {
            tokio::spawn(async move {
                let dispatch = pending.wait().await;
                debug!(kind = %kind, outcome = ?dispatch.outcome, "detached dispatch concluded");
            });
        } else {
            debug!(kind = %kind, "detached dispatch skipped: no handler registered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context() -> MessageContext {
        MessageContext {
            sender_id: AgentId::generate(),
            receiver_id: AgentId::generate(),
            organization_id: OrganizationId::generate(),
            handler_context: Value::Null,
            message_id: Some(MessageId::generate()),
            session_id: None,
            meeting_id: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_should_report_no_handler_when_kind_unregistered() {
        let registry = HandlerRegistry::new(Duration::from_secs(1));
        let dispatch = registry
            .dispatch(HandlerKind::OneWay, json!({}), test_context())
            .await;
        assert_eq!(dispatch.outcome, DispatchOutcome::NoHandler);
        assert!(dispatch.response.is_none());
    }

    #[tokio::test]
    async fn test_should_return_handler_value_when_dispatching() {
        let registry = HandlerRegistry::new(Duration::from_secs(1));
        registry.register_fn(HandlerKind::Conversation, |content, _ctx| async move {
            Ok(Some(json!({ "echo": content })))
        });
        let dispatch = registry
            .dispatch(HandlerKind::Conversation, json!("ping"), test_context())
            .await;
        assert_eq!(dispatch.outcome, DispatchOutcome::Returned);
        assert_eq!(dispatch.response, Some(json!({ "echo": "ping" })));
    }

    #[tokio::test]
    async fn test_should_replace_handler_when_registering_twice() {
        let registry = HandlerRegistry::new(Duration::from_secs(1));
        registry.register_fn(HandlerKind::OneWay, |_content, _ctx| async move {
            Ok(Some(json!("first")))
        });
        registry.register_fn(HandlerKind::OneWay, |_content, _ctx| async move {
            Ok(Some(json!("second")))
        });
        let dispatch = registry
            .dispatch(HandlerKind::OneWay, json!({}), test_context())
            .await;
        assert_eq!(dispatch.response, Some(json!("second")));
    }

    #[tokio::test]
    async fn test_should_swallow_handler_errors() {
        let registry = HandlerRegistry::new(Duration::from_secs(1));
        registry.register_fn(HandlerKind::Meeting, |_content, _ctx| async move {
            Err(anyhow::anyhow!("boom"))
        });
        let dispatch = registry
            .dispatch(HandlerKind::Meeting, json!({}), test_context())
            .await;
        assert_eq!(dispatch.outcome, DispatchOutcome::Errored);
        assert!(dispatch.response.is_none());
    }

    #[tokio::test]
    async fn test_should_time_out_handler_exceeding_ceiling() {
        let registry = HandlerRegistry::new(Duration::from_millis(20));
        registry.register_fn(HandlerKind::Conversation, |_content, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Some(json!("late")))
        });
        let dispatch = registry
            .dispatch(HandlerKind::Conversation, json!({}), test_context())
            .await;
        assert_eq!(dispatch.outcome, DispatchOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_should_keep_invocation_running_past_fast_path_budget() {
        let registry = HandlerRegistry::new(Duration::from_secs(5));
        registry.register_fn(HandlerKind::Conversation, |_content, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Some(json!("slow-but-successful")))
        });
        let pending = registry
            .begin(HandlerKind::Conversation, json!({}), test_context())
            .unwrap();
        let pending = pending
            .wait_budget(Duration::from_millis(5))
            .await
            .expect_err("budget should elapse before the handler finishes");
        let dispatch = pending.wait().await;
        assert_eq!(dispatch.outcome, DispatchOutcome::Returned);
        assert_eq!(dispatch.response, Some(json!("slow-but-successful")));
    }

    #[tokio::test]
    async fn test_should_surface_registration_context_to_handler() {
        let registry = HandlerRegistry::new(Duration::from_secs(1));
        struct Echoing;
        #[async_trait]
        impl MessageHandler for Echoing {
            async fn handle(
                &self,
                _content: Value,
                ctx: MessageContext,
            ) -> anyhow::Result<Option<Value>> {
                Ok(Some(ctx.handler_context))
            }
        }
        registry.register_with_context(
            HandlerKind::OneWay,
            Arc::new(Echoing),
            json!({ "tenant": "acme" }),
        );
        let dispatch = registry
            .dispatch(HandlerKind::OneWay, json!({}), test_context())
            .await;
        assert_eq!(dispatch.response, Some(json!({ "tenant": "acme" })));
    }
}
