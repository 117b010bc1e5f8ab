//! Gateway half of the demand coordinator
//!
//! Interest is tracked as the set of sessions subscribed to each StreamKey.
//! The demand count for a key is the size of that set, so one session
//! contributes at most one unit however often it subscribes. Only the edges
//! 0→1 and 1→0 are reported; those become `start` and `stop` commands.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use types::ids::SessionId;
use types::stream::StreamKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemandTransition {
    /// First interested session: ingestion should start the stream.
    Started(StreamKey),
    /// Last interested session left: ingestion may stop the stream.
    Stopped(StreamKey),
}

impl DemandTransition {
    pub fn key(&self) -> &StreamKey {
        match self {
            DemandTransition::Started(key) | DemandTransition::Stopped(key) => key,
        }
    }
}

#[derive(Debug, Default)]
pub struct GatewayDemand {
    interest: HashMap<StreamKey, BTreeSet<SessionId>>,
}

impl GatewayDemand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`'s interest in `key`.
    pub fn add(&mut self, key: &StreamKey, session: SessionId) -> Option<DemandTransition> {
        let sessions = self.interest.entry(key.clone()).or_default();
        let was_idle = sessions.is_empty();
        if sessions.insert(session) && was_idle {
            Some(DemandTransition::Started(key.clone()))
        } else {
            None
        }
    }

    /// Drop `session`'s interest in `key`. Removing interest that was never
    /// registered changes nothing.
    pub fn remove(&mut self, key: &StreamKey, session: SessionId) -> Option<DemandTransition> {
        let sessions = self.interest.get_mut(key)?;
        if !sessions.remove(&session) {
            return None;
        }
        if sessions.is_empty() {
            self.interest.remove(key);
            Some(DemandTransition::Stopped(key.clone()))
        } else {
            None
        }
    }

    pub fn count(&self, key: &StreamKey) -> usize {
        self.interest.get(key).map_or(0, BTreeSet::len)
    }

    /// Sessions interested in `key`, in id order.
    pub fn subscribers(&self, key: &StreamKey) -> impl Iterator<Item = SessionId> + '_ {
        self.interest.get(key).into_iter().flatten().copied()
    }

    /// Keys with at least one interested session.
    pub fn keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self.interest.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn counts(&self) -> BTreeMap<StreamKey, usize> {
        self.interest
            .iter()
            .map(|(key, sessions)| (key.clone(), sessions.len()))
            .collect()
    }

    /// Number of keys with demand.
    pub fn len(&self) -> usize {
        self.interest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interest.is_empty()
    }
}
