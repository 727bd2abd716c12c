//! In-process waiter table
//!
//! One process-global map from `(scope, agent)` to a one-shot signal plus an
//! optional payload slot. The scope is a session or meeting id. The table is
//! authoritative only for "is someone currently blocked here"; the durable
//! counterparts are `sessions.locked_agent_id` and
//! `meeting_participants.is_locked`.
//!
//! Entries live exactly for the duration of one blocking call: `register`
//! inserts, and the entry is removed by whichever of `deliver`, `cancel`, or
//! the waiter's own timeout fires first. Delivery is idempotent on the first
//! signal; later signals find no entry.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain_types::{AgentId, MeetingId, SessionId};
use crate::models::Message;

/// Key of one waiter entry: a session or meeting scope plus the blocked agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterKey {
    /// Session or meeting id the wait is scoped to
    pub scope: Uuid,
    /// The blocked agent
    pub agent_id: AgentId,
}

impl WaiterKey {
    /// Key for an agent blocked in a synchronous session wait
    #[must_use]
    pub fn session(session_id: SessionId, agent_id: AgentId) -> Self {
        Self {
            scope: session_id.into_inner(),
            agent_id,
        }
    }

    /// Key for an agent blocked waiting for its meeting turn
    #[must_use]
    pub fn meeting(meeting_id: MeetingId, agent_id: AgentId) -> Self {
        Self {
            scope: meeting_id.into_inner(),
            agent_id,
        }
    }
}

/// Why a waiter was cancelled rather than delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The session the waiter was parked on ended
    SessionEnded,
    /// The meeting the waiter was parked on ended
    MeetingEnded,
    /// The coordinator is shutting down
    Shutdown,
}

enum Signal {
    Delivered(Option<Message>),
    Cancelled(CancelReason),
}

/// Outcome of one blocking wait
#[derive(Debug)]
pub enum WaitOutcome {
    /// A peer handed over a payload (or an empty grant signal)
    Delivered(Option<Message>),
    /// The deadline elapsed first
    TimedOut,
    /// The wait was cancelled
    Cancelled(CancelReason),
}

/// Handle held by the single blocked caller of one entry
pub struct WaiterHandle {
    key: WaiterKey,
    rx: oneshot::Receiver<Signal>,
}

/// Process-global table of in-flight blocking waits
#[derive(Default)]
pub struct WaiterTable {
    entries: DashMap<WaiterKey, oneshot::Sender<Signal>>,
}

impl WaiterTable {
    /// Creates an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry for `key`. Returns `None` when the key is already
    /// occupied, i.e. the same agent is already blocked on the same scope.
    #[must_use]
    pub fn register(&self, key: WaiterKey) -> Option<WaiterHandle> {
        match self.entries.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Some(WaiterHandle { key, rx })
            }
        }
    }

    /// Blocks until delivery, cancellation, or `deadline`
    pub async fn wait(&self, handle: WaiterHandle, deadline: Instant) -> WaitOutcome {
        match tokio::time::timeout_at(deadline, handle.rx).await {
            Ok(Ok(Signal::Delivered(payload))) => WaitOutcome::Delivered(payload),
            Ok(Ok(Signal::Cancelled(reason))) => WaitOutcome::Cancelled(reason),
            // The sender side was dropped without a signal; this only
            // happens when the table is torn down.
            Ok(Err(_closed)) => WaitOutcome::Cancelled(CancelReason::Shutdown),
            Err(_elapsed) => {
                self.entries.remove(&handle.key);
                WaitOutcome::TimedOut
            }
        }
    }

    /// Hands `message` to the waiter at `key`, waking it. Returns whether a
    /// waiter was actually parked there.
    pub fn deliver(&self, key: &WaiterKey, message: Message) -> bool {
        self.signal(key, Signal::Delivered(Some(message)))
    }

    /// Wakes the waiter at `key` without a payload (used for turn grants)
    pub fn deliver_empty(&self, key: &WaiterKey) -> bool {
        self.signal(key, Signal::Delivered(None))
    }

    /// Cancels the waiter at `key`
    pub fn cancel(&self, key: &WaiterKey, reason: CancelReason) -> bool {
        self.signal(key, Signal::Cancelled(reason))
    }

    /// Cancels every waiter parked on `scope`
    pub fn cancel_scope(&self, scope: Uuid, reason: CancelReason) {
        let keys: Vec<WaiterKey> = self
            .entries
            .iter()
            .map(|entry| *entry.key())
            .filter(|key| key.scope == scope)
            .collect();
        for key in keys {
            self.cancel(&key, reason);
        }
    }

    /// Cancels every waiter in the table
    pub fn cancel_all(&self, reason: CancelReason) {
        let keys: Vec<WaiterKey> = self.entries.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.cancel(&key, reason);
        }
    }

    /// Whether an agent is currently blocked on `key`
    #[must_use]
    pub fn is_waiting(&self, key: &WaiterKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drops the entry at `key` without signalling, if it still exists
    pub fn remove(&self, key: &WaiterKey) {
        self.entries.remove(key);
    }

    fn signal(&self, key: &WaiterKey, signal: Signal) -> bool {
        if let Some((_, tx)) = self.entries.remove(key) {
            tx.send(signal).is_ok()
        } else {
            false
        }
    }
}
