//! Client sessions: outbound queues and subscription sets
//!
//! Each session owns a bounded [`Outbox`] drained by its socket writer. When a
//! session falls behind, its [`DropPolicy`] decides between disconnecting it
//! and discarding the oldest queued message.
//!
//! [`SessionRegistry`] holds every connected session together with the
//! gateway-side demand. Subscribing and unsubscribing go through the registry
//! so a session's subscription set and its demand contribution never drift
//! apart. Disconnecting unsubscribes each key through the same path.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;
use types::ids::SessionId;
use types::stream::StreamKey;

use crate::demand::{DemandTransition, GatewayDemand};

/// What to do when a session's outbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Disconnect the lagging session.
    Disconnect,
    /// Drop the oldest queued message to make room.
    DropOldest,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Messages queued per session before the drop policy applies.
    pub queue_capacity: usize,
    pub drop_policy: DropPolicy,
    pub max_subscriptions: usize,
    /// Inbound client messages allowed per second.
    pub messages_per_second: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            drop_policy: DropPolicy::Disconnect,
            max_subscriptions: 50,
            messages_per_second: 20,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    #[error("Session outbox closed")]
    Closed,

    #[error("Session lagging: {0} messages queued")]
    Lagging(usize),
}

#[derive(Debug, Default)]
struct OutboxState {
    messages: VecDeque<String>,
    closed: bool,
    dropped: u64,
}

/// Bounded outbound queue for one session.
///
/// Single consumer: the socket writer calls [`Outbox::next`].
#[derive(Debug)]
pub struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
    policy: DropPolicy,
}

impl Outbox {
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            state: Mutex::new(OutboxState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a payload for the writer.
    ///
    /// Under [`DropPolicy::Disconnect`] a full queue closes the outbox and
    /// returns [`OutboxError::Lagging`].
    pub fn push(&self, payload: String) -> Result<(), OutboxError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(OutboxError::Closed);
            }
            if state.messages.len() >= self.capacity {
                match self.policy {
                    DropPolicy::Disconnect => {
                        let queued = state.messages.len();
                        state.closed = true;
                        drop(state);
                        self.notify.notify_one();
                        return Err(OutboxError::Lagging(queued));
                    }
                    DropPolicy::DropOldest => {
                        state.messages.pop_front();
                        state.dropped += 1;
                    }
                }
            }
            state.messages.push_back(payload);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Next queued payload. Returns `None` once the outbox is closed and
    /// drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(payload) = state.messages.pop_front() {
                    return Some(payload);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting messages. Already queued messages are still handed out.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages discarded under [`DropPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("Unknown session")]
    UnknownSession,

    #[error("Max subscriptions ({0}) reached")]
    TooManySubscriptions(usize),
}

/// Result of a successful subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Identifies the snapshot request issued for this subscribe; only the
    /// latest one is delivered.
    pub generation: u64,
    /// The key was not already in the session's set.
    pub added: bool,
    pub transition: Option<DemandTransition>,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub outbox: Arc<Outbox>,
    pub subscriptions: BTreeSet<StreamKey>,
    /// Snapshot requests still awaiting delivery, by key.
    pending_snapshots: HashMap<StreamKey, u64>,
}

impl Session {
    fn new(id: SessionId, outbox: Arc<Outbox>) -> Self {
        Self {
            id,
            outbox,
            subscriptions: BTreeSet::new(),
            pending_snapshots: HashMap::new(),
        }
    }

    pub fn is_subscribed(&self, key: &StreamKey) -> bool {
        self.subscriptions.contains(key)
    }
}

/// Every connected session and the demand they add up to.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, Session>,
    demand: GatewayDemand,
    max_subscriptions: usize,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            demand: GatewayDemand::new(),
            max_subscriptions,
            next_generation: 1,
        }
    }

    /// Register a session. Returns `false` if the id is already taken.
    pub fn register(&mut self, id: SessionId, outbox: Arc<Outbox>) -> bool {
        if self.sessions.contains_key(&id) {
            return false;
        }
        self.sessions.insert(id, Session::new(id, outbox));
        debug!(session = %id, "Registered session");
        true
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn outbox(&self, id: SessionId) -> Option<Arc<Outbox>> {
        self.sessions.get(&id).map(|s| Arc::clone(&s.outbox))
    }

    /// Add `key` to the session's set and issue a snapshot generation.
    ///
    /// Subscribing to a key already in the set only issues a new generation.
    pub fn subscribe(&mut self, id: SessionId, key: &StreamKey) -> Result<Subscription, SubscribeError> {
        let session = self.sessions.get_mut(&id).ok_or(SubscribeError::UnknownSession)?;

        let added = !session.subscriptions.contains(key);
        if added && session.subscriptions.len() >= self.max_subscriptions {
            return Err(SubscribeError::TooManySubscriptions(self.max_subscriptions));
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        session.pending_snapshots.insert(key.clone(), generation);

        let transition = if added {
            session.subscriptions.insert(key.clone());
            self.demand.add(key, id)
        } else {
            None
        };

        Ok(Subscription {
            generation,
            added,
            transition,
        })
    }

    /// Remove `key` from the session's set. Unsubscribing a key the session
    /// does not hold is accepted and changes nothing.
    pub fn unsubscribe(&mut self, id: SessionId, key: &StreamKey) -> Result<Option<DemandTransition>, SubscribeError> {
        let session = self.sessions.get_mut(&id).ok_or(SubscribeError::UnknownSession)?;
        session.pending_snapshots.remove(key);
        if !session.subscriptions.remove(key) {
            return Ok(None);
        }
        Ok(self.demand.remove(key, id))
    }

    /// Unsubscribe every key the session holds, then forget it.
    pub fn disconnect(&mut self, id: SessionId) -> Option<(Session, Vec<DemandTransition>)> {
        let keys: Vec<StreamKey> = self.sessions.get(&id)?.subscriptions.iter().cloned().collect();

        let transitions = keys
            .iter()
            .filter_map(|key| self.unsubscribe(id, key).ok().flatten())
            .collect();

        let session = self.sessions.remove(&id)?;
        Some((session, transitions))
    }

    /// Claim the pending snapshot for `(id, key)` if `generation` is still
    /// the latest one issued and the session is still subscribed.
    pub fn claim_snapshot(&mut self, id: SessionId, key: &StreamKey, generation: u64) -> Option<Arc<Outbox>> {
        let session = self.sessions.get_mut(&id)?;
        if session.pending_snapshots.get(key) != Some(&generation) || !session.subscriptions.contains(key) {
            return None;
        }
        session.pending_snapshots.remove(key);
        Some(Arc::clone(&session.outbox))
    }

    /// Sessions subscribed to `key`.
    pub fn subscribers(&self, key: &StreamKey) -> Vec<SessionId> {
        self.demand.subscribers(key).collect()
    }

    pub fn demand(&self) -> &GatewayDemand {
        &self.demand
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total (session, key) subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.sessions.values().map(|s| s.subscriptions.len()).sum()
    }
}
