//! Ingestion-side demand tracking
//!
//! Demand for a StreamKey is the number of distinct origins (gateway
//! instances, or the manual-control origin) that currently want it. Counting
//! origins rather than messages makes duplicate deliveries harmless: a second
//! `start` from an origin that already has interest changes nothing, and a
//! `stop` from an origin without interest is a no-op.
//!
//! Commands carrying a per-origin `seq` (`reset` included) are dropped when
//! they are not newer than the last one applied for that origin, and the
//! high-water mark only ever rises. `seq == 0` is unsequenced and always
//! applied. Unsequenced commands from the anonymous origin are counted one by
//! one, floored at zero.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;
use types::command::{StreamCommand, ANONYMOUS_ORIGIN};
use types::stream::StreamKey;

/// A StreamKey crossing the zero boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemandChange {
    /// 0 → 1: the stream must be ensured.
    Activated(StreamKey),
    /// 1 → 0: the stream must be released.
    Deactivated(StreamKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Not newer than the origin's high-water mark; ignored.
    Stale,
    /// Applied; lists the keys whose demand crossed zero.
    Applied(Vec<DemandChange>),
}

impl ApplyOutcome {
    pub fn changes(&self) -> &[DemandChange] {
        match self {
            ApplyOutcome::Applied(changes) => changes,
            ApplyOutcome::Stale => &[],
        }
    }
}

#[derive(Debug, Default)]
pub struct IngestionDemand {
    origins: HashMap<StreamKey, BTreeSet<String>>,
    anonymous: HashMap<StreamKey, u64>,
    high_water: HashMap<String, u64>,
}

impl IngestionDemand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current demand for `key`.
    pub fn count(&self, key: &StreamKey) -> u64 {
        let origins = self.origins.get(key).map_or(0, |set| set.len() as u64);
        origins + self.anonymous.get(key).copied().unwrap_or(0)
    }

    /// Every key with demand, with its count.
    pub fn counts(&self) -> BTreeMap<StreamKey, u64> {
        self.origins
            .keys()
            .chain(self.anonymous.keys())
            .map(|key| (key.clone(), self.count(key)))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    pub fn apply(&mut self, command: &StreamCommand) -> ApplyOutcome {
        let origin = command.origin().to_string();
        let seq = command.seq();

        if seq != 0 {
            let last = self.high_water.entry(origin.clone()).or_default();
            if seq <= *last {
                debug!(origin = %origin, seq, last = *last, "Dropping stale stream command");
                return ApplyOutcome::Stale;
            }
            *last = seq;
        }

        if let StreamCommand::Reset { .. } = command {
            return ApplyOutcome::Applied(self.reset(&origin));
        }

        let Some(key) = command.stream_key() else {
            return ApplyOutcome::Applied(Vec::new());
        };
        let before = self.count(&key);
        let anonymous = origin == ANONYMOUS_ORIGIN && seq == 0;

        match command {
            StreamCommand::Start { .. } if anonymous => {
                *self.anonymous.entry(key.clone()).or_default() += 1;
            }
            StreamCommand::Start { .. } => {
                self.origins.entry(key.clone()).or_default().insert(origin);
            }
            StreamCommand::Stop { .. } if anonymous => {
                if let Some(count) = self.anonymous.get_mut(&key) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.anonymous.remove(&key);
                    }
                }
            }
            StreamCommand::Stop { .. } => {
                if let Some(set) = self.origins.get_mut(&key) {
                    set.remove(&origin);
                    if set.is_empty() {
                        self.origins.remove(&key);
                    }
                }
            }
            StreamCommand::Reset { .. } => {}
        }

        let after = self.count(&key);
        ApplyOutcome::Applied(transition(key, before, after).into_iter().collect())
    }

    /// Drop every interest held by `origin`.
    fn reset(&mut self, origin: &str) -> Vec<DemandChange> {
        let mut changes = Vec::new();
        let keys: Vec<StreamKey> = self
            .origins
            .iter()
            .filter(|(_, set)| set.contains(origin))
            .map(|(key, _)| key.clone())
            .collect();

        for key in keys {
            let before = self.count(&key);
            if let Some(set) = self.origins.get_mut(&key) {
                set.remove(origin);
                if set.is_empty() {
                    self.origins.remove(&key);
                }
            }
            changes.extend(transition(key.clone(), before, self.count(&key)));
        }
        changes.sort_by(|a, b| change_key(a).cmp(change_key(b)));
        changes
    }
}

fn transition(key: StreamKey, before: u64, after: u64) -> Option<DemandChange> {
    match (before, after) {
        (0, n) if n > 0 => Some(DemandChange::Activated(key)),
        (n, 0) if n > 0 => Some(DemandChange::Deactivated(key)),
        _ => None,
    }
}

fn change_key(change: &DemandChange) -> &StreamKey {
    match change {
        DemandChange::Activated(key) | DemandChange::Deactivated(key) => key,
    }
}
