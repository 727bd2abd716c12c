//! Meeting engine: lifecycle, turn scheduling, and the event log
//!
//! A meeting moves `created → ready → active → ended`. While active, a
//! per-meeting scheduler task owns the meeting's advisory lock on a pinned
//! connection and is the only writer of turn rotations: it waits up to
//! `turn_duration` for a yield signal (explicit `yield_turn`, or the current
//! speaker leaving) and otherwise rotates on timeout. Every state-visible
//! change appends to `meeting_events` in the same transaction as the change
//! itself; matching handler kinds are dispatched fire-and-forget after
//! commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{CoordinatorConfig, validate_sync_timeout, validate_turn_duration};
use crate::domain_types::MeetingId;
use crate::error::{CoordinationError, CoordinationResult};
use crate::handlers::{HandlerKind, HandlerRegistry, MessageContext};
use crate::identity::IdentityRegistry;
use crate::models::{
    Meeting, MeetingEvent, MeetingEventType, MeetingParticipant, MeetingStatus, Message,
    MessageFilter, MessageType, ParticipantStatus,
};
use crate::store::messages::NewMessage;
use crate::store::{LockKey, StoreGateway, identity, meetings, messages};
use crate::waiters::{CancelReason, WaitOutcome, WaiterKey, WaiterTable};

/// Engine behind the meeting facade.
///
/// Cloning is cheap; clones share the runtime state, which is what lets the
/// turn scheduler run as a spawned task over the same engine.
#[derive(Clone)]
pub struct MeetingEngine {
    store: Arc<StoreGateway>,
    handlers: Arc<HandlerRegistry>,
    waiters: Arc<WaiterTable>,
    identity: Arc<IdentityRegistry>,
    config: CoordinatorConfig,
    /// Per-meeting yield signal consumed by the turn scheduler
    yield_signals: Arc<DashMap<MeetingId, Arc<Notify>>>,
    /// Scheduler task handles, kept for shutdown
    scheduler_tasks: Arc<DashMap<MeetingId, JoinHandle<()>>>,
}

impl MeetingEngine {
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
            yield_signals: Arc::new(DashMap::new()),
            scheduler_tasks: Arc::new(DashMap::new()),
        }
    }

    async fn require_meeting(&self, meeting_id: MeetingId) -> CoordinationResult<Meeting> {
        meetings::fetch_meeting(self.store.pool(), meeting_id)
            .await?
            .ok_or_else(|| CoordinationError::not_found("meeting", meeting_id.to_string()))
    }

    /// Creates a meeting in state `created` with the host as participant
    /// zero. The turn duration defaults from configuration.
    #[instrument(skip(self), fields(host = host_ext))]
    pub async fn create_meeting(
        &self,
        host_ext: &str,
        turn_duration: Option<Duration>,
    ) -> CoordinationResult<Meeting> {
        let host = self.identity.resolve_agent("host", host_ext).await?;
        let duration = match turn_duration {
            Some(duration) => validate_turn_duration(duration)?,
            None => self.config.default_turn_duration.as_duration(),
        };
        let turn_duration_ms = i64::try_from(duration.as_millis()).map_err(|_| {
            CoordinationError::validation("turn_duration", "turn duration is too large")
        })?;

        let mut tx = self.store.begin().await?;
        let meeting = meetings::insert_meeting(&mut *tx, host.id, turn_duration_ms).await?;
        meetings::insert_participant(
            &mut *tx,
            meeting.id,
            host.id,
            0,
            ParticipantStatus::Invited,
        )
        .await?;
        tx.commit().await?;
        info!(meeting_id = %meeting.id, "meeting created");
        Ok(meeting)
    }

    /// Adds an agent to the roster with the next `join_order`. The
    /// `participant_joined` event is deferred until the agent actually joins.
    #[instrument(skip(self), fields(meeting_id = %meeting_id, agent = agent_ext))]
    pub async fn invite(
        &self,
        meeting_id: MeetingId,
        agent_ext: &str,
    ) -> CoordinationResult<MeetingParticipant> {
        let agent = self.identity.resolve_agent("agent", agent_ext).await?;
        let meeting = self.require_meeting(meeting_id).await?;
        if meeting.status == MeetingStatus::Ended {
            return Err(CoordinationError::MeetingEnded { meeting_id });
        }

        let mut tx = self.store.begin().await?;
        let join_order = meetings::next_join_order(&mut *tx, meeting_id).await?;
        let participant = meetings::insert_participant(
            &mut *tx,
            meeting_id,
            agent.id,
            join_order,
            ParticipantStatus::Invited,
        )
        .await?;
        tx.commit().await?;
        Ok(participant)
    }

    /// Transitions an invited participant to `attending`; the meeting itself
    /// moves `created → ready` on the first non-host join.
    #[instrument(skip(self), fields(meeting_id = %meeting_id, agent = agent_ext))]
    pub async fn join(
        &self,
        meeting_id: MeetingId,
        agent_ext: &str,
    ) -> CoordinationResult<MeetingParticipant> {
        let agent = self.identity.resolve_agent("agent", agent_ext).await?;
        let meeting = self.require_meeting(meeting_id).await?;
        if meeting.status == MeetingStatus::Ended {
            return Err(CoordinationError::MeetingEnded { meeting_id });
        }

        let mut tx = self.store.begin().await?;
        let participant = meetings::fetch_participant(&mut *tx, meeting_id, agent.id)
            .await?
            .ok_or_else(|| {
                CoordinationError::not_found("meeting participant", agent_ext.to_string())
            })?;
        match participant.status {
            ParticipantStatus::Invited => {}
            ParticipantStatus::Left => {
                return Err(CoordinationError::Conflict {
                    reason: format!("agent '{agent_ext}' has already left the meeting"),
                });
            }
            // Joining twice is a no-op.
            _ => return Ok(participant),
        }

        meetings::mark_participant_joined(&mut *tx, meeting_id, agent.id).await?;
        if meeting.status == MeetingStatus::Created && agent.id != meeting.host_id {
            meetings::mark_ready(&mut *tx, meeting_id).await?;
        }
        let event = meetings::insert_event(
            &mut *tx,
            meeting_id,
            MeetingEventType::ParticipantJoined,
            Some(agent.id),
            &json!({ "agent": agent.external_id }),
        )
        .await?;
        tx.commit().await?;

        self.dispatch_event(event).await;
        meetings::fetch_participant(self.store.pool(), meeting_id, agent.id)
            .await?
            .ok_or(CoordinationError::Store {
                source: sqlx::Error::RowNotFound,
            })
    }

    /// Starts a ready meeting: the host implicitly attends, the attendee with
    /// the smallest `join_order` becomes the first speaker, and the turn
    /// scheduler task is spawned.
    #[instrument(skip(self), fields(meeting_id = %meeting_id, host = host_ext))]
    pub async fn start_meeting(
        &self,
        meeting_id: MeetingId,
        host_ext: &str,
    ) -> CoordinationResult<Meeting> {
        let host = self.identity.resolve_agent("host", host_ext).await?;
        let meeting = self.require_meeting(meeting_id).await?;
        if meeting.host_id != host.id {
            return Err(CoordinationError::validation(
                "host",
                "only the host may start the meeting",
            ));
        }
        match meeting.status {
            MeetingStatus::Ready => {}
            MeetingStatus::Created => {
                return Err(CoordinationError::validation(
                    "meeting",
                    "no participant has joined yet",
                ));
            }
            MeetingStatus::Active => {
                return Err(CoordinationError::Conflict {
                    reason: "meeting is already active".to_string(),
                });
            }
            MeetingStatus::Ended => {
                return Err(CoordinationError::MeetingEnded { meeting_id });
            }
        }

        let mut tx = self.store.begin().await?;
        let host_participant = meetings::fetch_participant(&mut *tx, meeting_id, host.id)
            .await?
            .ok_or_else(|| {
                CoordinationError::not_found("meeting participant", host_ext.to_string())
            })?;
        if host_participant.status == ParticipantStatus::Invited {
            meetings::mark_participant_joined(&mut *tx, meeting_id, host.id).await?;
        }
        let participants = meetings::fetch_participants(&mut *tx, meeting_id).await?;
        let first_speaker = participants
            .iter()
            .filter(|participant| participant.status.is_present())
            .min_by_key(|participant| participant.join_order)
            .map(|participant| participant.agent_id)
            .ok_or_else(|| {
                CoordinationError::validation("meeting", "no attending participant to speak first")
            })?;

        meetings::activate_meeting(&mut *tx, meeting_id, first_speaker).await?;
        meetings::set_participant_status(
            &mut *tx,
            meeting_id,
            first_speaker,
            ParticipantStatus::Speaking,
        )
        .await?;
        let started = meetings::insert_event(
            &mut *tx,
            meeting_id,
            MeetingEventType::MeetingStarted,
            Some(host.id),
            &json!({ "first_speaker": first_speaker }),
        )
        .await?;
        let turn_changed = meetings::insert_event(
            &mut *tx,
            meeting_id,
            MeetingEventType::TurnChanged,
            Some(first_speaker),
            &json!({ "from": Value::Null, "to": first_speaker }),
        )
        .await?;
        tx.commit().await?;

        self.dispatch_event(started).await;
        self.dispatch_event(turn_changed).await;
        self.spawn_scheduler(meeting_id);
        info!(meeting_id = %meeting_id, "meeting started");
        self.require_meeting(meeting_id).await
    }

    /// The current speaker cedes the floor; the scheduler rotates promptly
    #[instrument(skip(self), fields(meeting_id = %meeting_id, agent = agent_ext))]
    pub async fn yield_turn(
        &self,
        meeting_id: MeetingId,
        agent_ext: &str,
    ) -> CoordinationResult<()> {
        let agent = self.identity.resolve_agent("agent", agent_ext).await?;
        let meeting = self.require_meeting(meeting_id).await?;
        match meeting.status {
            MeetingStatus::Ended => return Err(CoordinationError::MeetingEnded { meeting_id }),
            MeetingStatus::Active => {}
            _ => {
                return Err(CoordinationError::validation(
                    "meeting",
                    "meeting has not started",
                ));
            }
        }
        if meeting.current_speaker_id != Some(agent.id) {
            return Err(CoordinationError::NotYourTurn {
                meeting_id,
                agent_id: agent.id,
            });
        }
        self.notify_scheduler(meeting_id);
        Ok(())
    }

    /// Sends a message into the meeting; only the current speaker may.
    /// The `Meeting` handler is dispatched once per present participant
    /// except the sender.
    #[instrument(skip(self, content, metadata), fields(meeting_id = %meeting_id, sender = sender_ext))]
    pub async fn meeting_send(
        &self,
        sender_ext: &str,
        meeting_id: MeetingId,
        content: Value,
        metadata: Option<Value>,
    ) -> CoordinationResult<Message> {
        let sender = self.identity.resolve_agent("sender", sender_ext).await?;
        let meeting = self.require_meeting(meeting_id).await?;
        match meeting.status {
            MeetingStatus::Ended => return Err(CoordinationError::MeetingEnded { meeting_id }),
            MeetingStatus::Active => {}
            _ => {
                return Err(CoordinationError::validation(
                    "meeting",
                    "meeting has not started",
                ));
            }
        }
        if meeting.current_speaker_id != Some(sender.id) {
            return Err(CoordinationError::NotYourTurn {
                meeting_id,
                agent_id: sender.id,
            });
        }

        let message = messages::insert_message(
            self.store.pool(),
            NewMessage {
                sender_id: sender.id,
                recipient_id: None,
                session_id: None,
                meeting_id: Some(meeting_id),
                message_type: MessageType::UserDefined,
                content: &content,
                metadata: metadata.as_ref(),
                read_at: None,
            },
        )
        .await?;

        let participants = meetings::fetch_participants(self.store.pool(), meeting_id).await?;
        for participant in participants
            .iter()
            .filter(|participant| {
                participant.status.is_present() && participant.agent_id != sender.id
            })
        {
            let Some(receiver) =
                identity::fetch_agent_by_id(self.store.pool(), participant.agent_id).await?
            else {
                continue;
            };
            let ctx = MessageContext {
                sender_id: sender.id,
                receiver_id: receiver.id,
                organization_id: receiver.organization_id,
                handler_context: Value::Null,
                message_id: Some(message.id),
                session_id: None,
                meeting_id: Some(meeting_id),
                metadata: metadata.clone(),
            };
            self.handlers
                .dispatch_detached(HandlerKind::Meeting, content.clone(), ctx);
        }
        Ok(message)
    }

    /// Blocks the participant until it becomes the current speaker.
    ///
    /// The participant row carries `status = waiting` and `is_locked = true`
    /// for the duration, the durable counterpart of the waiter entry. On
    /// `end_meeting` the call fails with `MeetingEnded` rather than timing
    /// out.
    #[instrument(skip(self), fields(meeting_id = %meeting_id, agent = agent_ext))]
    pub async fn await_turn(
        &self,
        meeting_id: MeetingId,
        agent_ext: &str,
        timeout: Option<Duration>,
    ) -> CoordinationResult<()> {
        let timeout = match timeout {
            Some(timeout) => validate_sync_timeout(timeout)?,
            None => self.config.default_sync_timeout.as_duration(),
        };
        let agent = self.identity.resolve_agent("agent", agent_ext).await?;
        let meeting = self.require_meeting(meeting_id).await?;
        match meeting.status {
            MeetingStatus::Ended => return Err(CoordinationError::MeetingEnded { meeting_id }),
            MeetingStatus::Active => {}
            _ => {
                return Err(CoordinationError::validation(
                    "meeting",
                    "meeting has not started",
                ));
            }
        }
        let participant = meetings::fetch_participant(self.store.pool(), meeting_id, agent.id)
            .await?
            .ok_or_else(|| {
                CoordinationError::not_found("meeting participant", agent_ext.to_string())
            })?;
        if participant.status == ParticipantStatus::Left {
            return Err(CoordinationError::Conflict {
                reason: format!("agent '{agent_ext}' has left the meeting"),
            });
        }
        if meeting.current_speaker_id == Some(agent.id) {
            return Ok(());
        }

        let key = WaiterKey::meeting(meeting_id, agent.id);
        let Some(handle) = self.waiters.register(key) else {
            return Err(CoordinationError::Conflict {
                reason: format!("agent '{agent_ext}' is already waiting for its turn"),
            });
        };
        let guard = TurnWaitGuard {
            store: self.store.clone(),
            waiters: self.waiters.clone(),
            key,
            armed: true,
        };
        if participant.status == ParticipantStatus::Attending {
            meetings::set_participant_status(
                self.store.pool(),
                meeting_id,
                agent.id,
                ParticipantStatus::Waiting,
            )
            .await?;
        }
        meetings::set_participant_locked(self.store.pool(), meeting_id, agent.id, true).await?;

        // Re-check now that the waiter is registered: a rotation between the
        // speaker check and registration would have signalled nobody.
        if let Some(current) = meetings::fetch_meeting(self.store.pool(), meeting_id).await? {
            if current.status == MeetingStatus::Ended {
                guard.finish().await;
                return Err(CoordinationError::MeetingEnded { meeting_id });
            }
            if current.current_speaker_id == Some(agent.id) {
                guard.finish().await;
                return Ok(());
            }
        }

        let outcome = self.waiters.wait(handle, Instant::now() + timeout).await;
        let result = match outcome {
            WaitOutcome::Delivered(_) => Ok(()),
            WaitOutcome::TimedOut => Err(CoordinationError::Timeout { waited: timeout }),
            WaitOutcome::Cancelled(CancelReason::Shutdown) => Err(CoordinationError::Shutdown),
            WaitOutcome::Cancelled(_) => Err(CoordinationError::MeetingEnded { meeting_id }),
        };
        guard.finish().await;
        result
    }

    /// Marks the participant `left`. A leaving speaker triggers immediate
    /// rotation; when only the host remains present the meeting ends.
    #[instrument(skip(self), fields(meeting_id = %meeting_id, agent = agent_ext))]
    pub async fn leave(&self, meeting_id: MeetingId, agent_ext: &str) -> CoordinationResult<()> {
        let agent = self.identity.resolve_agent("agent", agent_ext).await?;

        let mut tx = self.store.begin().await?;
        let meeting = meetings::fetch_meeting_for_update(&mut *tx, meeting_id)
            .await?
            .ok_or_else(|| CoordinationError::not_found("meeting", meeting_id.to_string()))?;
        if meeting.status == MeetingStatus::Ended {
            return Err(CoordinationError::MeetingEnded { meeting_id });
        }
        let participant = meetings::fetch_participant(&mut *tx, meeting_id, agent.id)
            .await?
            .ok_or_else(|| {
                CoordinationError::not_found("meeting participant", agent_ext.to_string())
            })?;
        if participant.status == ParticipantStatus::Left {
            return Err(CoordinationError::Conflict {
                reason: format!("agent '{agent_ext}' has already left the meeting"),
            });
        }

        meetings::mark_participant_left(&mut *tx, meeting_id, agent.id).await?;
        let left_event = meetings::insert_event(
            &mut *tx,
            meeting_id,
            MeetingEventType::ParticipantLeft,
            Some(agent.id),
            &json!({ "agent": agent.external_id }),
        )
        .await?;

        let participants = meetings::fetch_participants(&mut *tx, meeting_id).await?;
        let only_host_remains = participants
            .iter()
            .filter(|participant| participant.status.is_present())
            .all(|participant| participant.agent_id == meeting.host_id);
        let was_speaker = meeting.current_speaker_id == Some(agent.id);

        let mut ended_event = None;
        if meeting.status == MeetingStatus::Active && only_host_remains {
            meetings::end_meeting_row(&mut *tx, meeting_id).await?;
            let note = json!({ "reason": "only the host remains" });
            messages::insert_message(
                &mut *tx,
                NewMessage {
                    sender_id: meeting.host_id,
                    recipient_id: None,
                    session_id: None,
                    meeting_id: Some(meeting_id),
                    message_type: MessageType::Ending,
                    content: &note,
                    metadata: None,
                    read_at: None,
                },
            )
            .await?;
            ended_event = Some(
                meetings::insert_event(
                    &mut *tx,
                    meeting_id,
                    MeetingEventType::MeetingEnded,
                    Some(meeting.host_id),
                    &note,
                )
                .await?,
            );
        }
        tx.commit().await?;

        self.dispatch_event(left_event).await;
        if let Some(event) = ended_event {
            self.waiters
                .cancel_scope(meeting_id.into_inner(), CancelReason::MeetingEnded);
            self.notify_scheduler(meeting_id);
            self.dispatch_event(event).await;
        } else if was_speaker {
            self.notify_scheduler(meeting_id);
        }
        Ok(())
    }

    /// Ends the meeting (host only) and cancels every in-meeting waiter
    #[instrument(skip(self), fields(meeting_id = %meeting_id, host = host_ext))]
    pub async fn end_meeting(
        &self,
        meeting_id: MeetingId,
        host_ext: &str,
    ) -> CoordinationResult<Meeting> {
        let host = self.identity.resolve_agent("host", host_ext).await?;
        let meeting = self.require_meeting(meeting_id).await?;
        if meeting.status == MeetingStatus::Ended {
            return Err(CoordinationError::MeetingEnded { meeting_id });
        }
        if meeting.host_id != host.id {
            return Err(CoordinationError::validation(
                "host",
                "only the host may end the meeting",
            ));
        }

        let mut tx = self.store.begin().await?;
        let Some(ended) = meetings::end_meeting_row(&mut *tx, meeting_id).await? else {
            return Err(CoordinationError::MeetingEnded { meeting_id });
        };
        let note = json!({ "reason": "meeting_ended" });
        messages::insert_message(
            &mut *tx,
            NewMessage {
                sender_id: host.id,
                recipient_id: None,
                session_id: None,
                meeting_id: Some(meeting_id),
                message_type: MessageType::Ending,
                content: &note,
                metadata: None,
                read_at: None,
            },
        )
        .await?;
        let event = meetings::insert_event(
            &mut *tx,
            meeting_id,
            MeetingEventType::MeetingEnded,
            Some(host.id),
            &json!({ "by": host.external_id }),
        )
        .await?;
        tx.commit().await?;

        self.waiters
            .cancel_scope(meeting_id.into_inner(), CancelReason::MeetingEnded);
        self.notify_scheduler(meeting_id);
        self.dispatch_event(event).await;
        info!(meeting_id = %meeting_id, "meeting ended");
        Ok(ended)
    }

    /// Looks up a meeting
    pub async fn get_meeting(&self, meeting_id: MeetingId) -> CoordinationResult<Meeting> {
        self.require_meeting(meeting_id).await
    }

    /// All participants of a meeting in rotation order
    pub async fn get_participants(
        &self,
        meeting_id: MeetingId,
    ) -> CoordinationResult<Vec<MeetingParticipant>> {
        self.require_meeting(meeting_id).await?;
        meetings::fetch_participants(self.store.pool(), meeting_id).await
    }

    /// Full ordered message history of a meeting
    pub async fn get_meeting_messages(
        &self,
        meeting_id: MeetingId,
        filter: &MessageFilter,
    ) -> CoordinationResult<Vec<Message>> {
        self.require_meeting(meeting_id).await?;
        messages::fetch_meeting_messages(self.store.pool(), meeting_id, filter).await
    }

    /// The append-only event log of a meeting
    pub async fn get_meeting_events(
        &self,
        meeting_id: MeetingId,
    ) -> CoordinationResult<Vec<MeetingEvent>> {
        self.require_meeting(meeting_id).await?;
        meetings::fetch_events(self.store.pool(), meeting_id).await
    }

    /// Aborts every turn scheduler. Their advisory-lock guards release on drop.
    pub(crate) fn shutdown(&self) {
        for entry in self.scheduler_tasks.iter() {
            entry.value().abort();
        }
        self.scheduler_tasks.clear();
        self.yield_signals.clear();
    }

    fn notify_scheduler(&self, meeting_id: MeetingId) {
        if let Some(signal) = self.yield_signals.get(&meeting_id) {
            signal.notify_one();
        } else {
            debug!(%meeting_id, "no local turn scheduler to signal");
        }
    }

    fn spawn_scheduler(&self, meeting_id: MeetingId) {
        let signal = Arc::new(Notify::new());
        self.yield_signals.insert(meeting_id, signal.clone());
        let engine = self.clone();
        let task = tokio::spawn(async move {
            engine.run_turn_scheduler(meeting_id, signal).await;
            engine.yield_signals.remove(&meeting_id);
            engine.scheduler_tasks.remove(&meeting_id);
        });
        self.scheduler_tasks.insert(meeting_id, task);
    }

    /// Per-meeting scheduler loop. Holds the meeting advisory lock for its
    /// lifetime; a contended acquire means another scheduler already runs.
    async fn run_turn_scheduler(&self, meeting_id: MeetingId, signal: Arc<Notify>) {
        let lock = match self
            .store
            .try_advisory_lock(LockKey::for_entity(meeting_id.into_inner()))
            .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                warn!(%meeting_id, "another turn scheduler already holds the meeting lock");
                return;
            }
            Err(error) => {
                warn!(%meeting_id, %error, "failed to acquire meeting advisory lock");
                return;
            }
        };

        loop {
            let meeting = match meetings::fetch_meeting(self.store.pool(), meeting_id).await {
                Ok(Some(meeting)) => meeting,
                Ok(None) => break,
                Err(error) => {
                    warn!(%meeting_id, %error, "turn scheduler failed to read meeting");
                    break;
                }
            };
            if meeting.status != MeetingStatus::Active {
                break;
            }

            let elapsed = meeting
                .turn_started_at
                .map(|started| (Utc::now() - started).to_std().unwrap_or_default())
                .unwrap_or_default();
            let remaining = meeting.turn_duration().saturating_sub(elapsed);

            let timed_out = tokio::select! {
                () = signal.notified() => false,
                () = tokio::time::sleep(remaining) => true,
            };

            if let Err(error) = self.rotate_turn(meeting_id, timed_out).await {
                warn!(%meeting_id, %error, "turn rotation failed");
                break;
            }
        }

        if let Err(error) = lock.release().await {
            warn!(%meeting_id, %error, "failed to release meeting advisory lock");
        }
        debug!(%meeting_id, "turn scheduler stopped");
    }

    /// One transactional rotation step: pick the next speaker, swap statuses,
    /// advance `turn_started_at`, and log events. On timeout the stalled
    /// speaker also gets a `turn_timeout` event and a system timeout message.
    async fn rotate_turn(&self, meeting_id: MeetingId, timed_out: bool) -> CoordinationResult<()> {
        let mut tx = self.store.begin().await?;
        let Some(meeting) = meetings::fetch_meeting_for_update(&mut *tx, meeting_id).await? else {
            return Ok(());
        };
        if meeting.status != MeetingStatus::Active {
            return Ok(());
        }
        let participants = meetings::fetch_participants(&mut *tx, meeting_id).await?;
        let present: Vec<&MeetingParticipant> = participants
            .iter()
            .filter(|participant| participant.status.is_present())
            .collect();

        if present.is_empty() {
            meetings::end_meeting_row(&mut *tx, meeting_id).await?;
            let event = meetings::insert_event(
                &mut *tx,
                meeting_id,
                MeetingEventType::MeetingEnded,
                Some(meeting.host_id),
                &json!({ "reason": "no participants remain" }),
            )
            .await?;
            tx.commit().await?;
            self.waiters
                .cancel_scope(meeting_id.into_inner(), CancelReason::MeetingEnded);
            self.dispatch_event(event).await;
            return Ok(());
        }

        let current = meeting.current_speaker_id;
        let current_order = current
            .and_then(|id| {
                participants
                    .iter()
                    .find(|participant| participant.agent_id == id)
            })
            .map(|participant| participant.join_order);
        let Some(next) = next_speaker(&present, current_order) else {
            return Ok(());
        };
        let next_id = next.agent_id;

        let mut events = Vec::new();
        if timed_out {
            if let Some(stalled) = current {
                let note = json!({ "turn_timeout_ms": meeting.turn_duration_ms });
                messages::insert_message(
                    &mut *tx,
                    NewMessage {
                        sender_id: stalled,
                        recipient_id: None,
                        session_id: None,
                        meeting_id: Some(meeting_id),
                        message_type: MessageType::Timeout,
                        content: &note,
                        metadata: None,
                        read_at: None,
                    },
                )
                .await?;
                events.push(
                    meetings::insert_event(
                        &mut *tx,
                        meeting_id,
                        MeetingEventType::TurnTimeout,
                        Some(stalled),
                        &json!({ "speaker": stalled }),
                    )
                    .await?,
                );
            }
        }

        // The outgoing speaker returns to the floor unless it already left.
        if let Some(previous) = current {
            let still_speaking = participants.iter().any(|participant| {
                participant.agent_id == previous
                    && participant.status == ParticipantStatus::Speaking
            });
            if still_speaking && previous != next_id {
                meetings::set_participant_status(
                    &mut *tx,
                    meeting_id,
                    previous,
                    ParticipantStatus::Attending,
                )
                .await?;
            }
        }

        meetings::set_current_speaker(&mut *tx, meeting_id, next_id).await?;
        meetings::set_participant_status(
            &mut *tx,
            meeting_id,
            next_id,
            ParticipantStatus::Speaking,
        )
        .await?;
        meetings::set_participant_locked(&mut *tx, meeting_id, next_id, false).await?;
        events.push(
            meetings::insert_event(
                &mut *tx,
                meeting_id,
                MeetingEventType::TurnChanged,
                Some(next_id),
                &json!({ "from": current, "to": next_id }),
            )
            .await?,
        );
        tx.commit().await?;

        // Wake the incoming speaker if it is blocked in await_turn.
        self.waiters
            .deliver_empty(&WaiterKey::meeting(meeting_id, next_id));
        for event in events {
            self.dispatch_event(event).await;
        }
        debug!(%meeting_id, speaker = %next_id, timed_out, "turn rotated");
        Ok(())
    }

    /// Dispatches the handler kind matching an event, fire-and-forget
    async fn dispatch_event(&self, event: MeetingEvent) {
        let kind = HandlerKind::from(event.event_type);
        if !self.handlers.has(kind) {
            return;
        }
        let Some(agent_id) = event.agent_id else {
            return;
        };
        match identity::fetch_agent_by_id(self.store.pool(), agent_id).await {
            Ok(Some(agent)) => {
                let ctx = MessageContext {
                    sender_id: agent.id,
                    receiver_id: agent.id,
                    organization_id: agent.organization_id,
                    handler_context: Value::Null,
                    message_id: None,
                    session_id: None,
                    meeting_id: Some(event.meeting_id),
                    metadata: None,
                };
                self.handlers.dispatch_detached(kind, event.data.clone(), ctx);
            }
            Ok(None) => {}
            Err(error) => {
                warn!(%error, event_type = %event.event_type.as_str(), "failed to load agent for event dispatch");
            }
        }
    }
}

/// Next-speaker selection: the present participant with the smallest
/// `join_order` strictly greater than the current speaker's, wrapping to the
/// smallest overall.
fn next_speaker<'a>(
    present: &[&'a MeetingParticipant],
    current_order: Option<i32>,
) -> Option<&'a MeetingParticipant> {
    if let Some(order) = current_order {
        if let Some(next) = present
            .iter()
            .copied()
            .filter(|participant| participant.join_order > order)
            .min_by_key(|participant| participant.join_order)
        {
            return Some(next);
        }
    }
    present
        .iter()
        .min_by_key(|participant| participant.join_order)
        .copied()
}

/// Teardown for one blocking turn wait: clears `is_locked` and reverts a
/// still-`waiting` status to `attending`. `Drop` spawns the same teardown if
/// the owning task is cancelled mid-wait.
struct TurnWaitGuard {
    store: Arc<StoreGateway>,
    waiters: Arc<WaiterTable>,
    key: WaiterKey,
    armed: bool,
}

impl TurnWaitGuard {
    async fn finish(mut self) {
        self.armed = false;
        self.waiters.remove(&self.key);
        if let Err(error) = meetings::release_turn_wait(
            self.store.pool(),
            MeetingId::new(self.key.scope),
            self.key.agent_id,
        )
        .await
        {
            warn!(%error, "failed to clear turn-wait state");
        }
    }
}

impl Drop for TurnWaitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.waiters.remove(&self.key);
        let store = self.store.clone();
        let key = self.key;
        tokio::spawn(async move {
            if let Err(error) =
                meetings::release_turn_wait(store.pool(), MeetingId::new(key.scope), key.agent_id)
                    .await
            {
                warn!(%error, "failed to clear turn-wait state during cancellation");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::AgentId;

    fn participant(agent_id: AgentId, join_order: i32, status: ParticipantStatus) -> MeetingParticipant {
        MeetingParticipant {
            meeting_id: MeetingId::generate(),
            agent_id,
            status,
            join_order,
            is_locked: false,
            joined_at: None,
            left_at: None,
        }
    }

    #[test]
    fn test_should_pick_next_join_order_after_current_speaker() {
        let a = AgentId::generate();
        let b = AgentId::generate();
        let c = AgentId::generate();
        let roster = vec![
            participant(a, 0, ParticipantStatus::Speaking),
            participant(b, 1, ParticipantStatus::Attending),
            participant(c, 2, ParticipantStatus::Waiting),
        ];
        let present: Vec<&MeetingParticipant> = roster.iter().collect();
        let next = next_speaker(&present, Some(0)).unwrap();
        assert_eq!(next.agent_id, b);
    }

    #[test]
    fn test_should_wrap_to_smallest_join_order_after_last_speaker() {
        let a = AgentId::generate();
        let b = AgentId::generate();
        let roster = vec![
            participant(a, 0, ParticipantStatus::Attending),
            participant(b, 3, ParticipantStatus::Speaking),
        ];
        let present: Vec<&MeetingParticipant> = roster.iter().collect();
        let next = next_speaker(&present, Some(3)).unwrap();
        assert_eq!(next.agent_id, a);
    }

    #[test]
    fn test_should_skip_departed_participants_in_rotation() {
        let a = AgentId::generate();
        let c = AgentId::generate();
        // b (join_order 1) left, so it never makes it into the present list.
        let roster = vec![
            participant(a, 0, ParticipantStatus::Speaking),
            participant(c, 2, ParticipantStatus::Attending),
        ];
        let present: Vec<&MeetingParticipant> = roster.iter().collect();
        let next = next_speaker(&present, Some(0)).unwrap();
        assert_eq!(next.agent_id, c);
    }

    #[test]
    fn test_should_keep_sole_speaker_when_no_one_else_is_present() {
        let a = AgentId::generate();
        let roster = vec![participant(a, 1, ParticipantStatus::Speaking)];
        let present: Vec<&MeetingParticipant> = roster.iter().collect();
        let next = next_speaker(&present, Some(1)).unwrap();
        assert_eq!(next.agent_id, a);
    }

    #[test]
    fn test_should_return_none_when_no_participant_is_present() {
        let present: Vec<&MeetingParticipant> = Vec::new();
        assert!(next_speaker(&present, Some(0)).is_none());
    }
}
