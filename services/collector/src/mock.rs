//! Scripted upstream for driving the ingestion actor without a network
//!
//! Each `connect` opens a feed whose bars are pushed by the caller. The
//! connector counts connect attempts and currently open feeds per key, which
//! is what the connection-lifecycle properties are checked against.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use types::bar::Bar;
use types::stream::StreamKey;

use crate::error::UpstreamError;
use crate::upstream::{TickSource, UpstreamConnector};

type Feed = mpsc::UnboundedSender<Result<Bar, UpstreamError>>;

#[derive(Default)]
struct MockState {
    feeds: HashMap<StreamKey, Feed>,
    connects: HashMap<StreamKey, usize>,
    open: HashMap<StreamKey, usize>,
    refused: HashSet<StreamKey>,
    hanging: HashSet<StreamKey>,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Push a bar into the live feed for `key`. Returns false if no feed is open.
    pub fn push_bar(&self, key: &StreamKey, bar: Bar) -> bool {
        self.with_state(|s| s.feeds.get(key).is_some_and(|feed| feed.send(Ok(bar)).is_ok()))
    }

    /// Make the live feed for `key` fail with a socket error.
    pub fn fail(&self, key: &StreamKey) -> bool {
        self.with_state(|s| {
            s.feeds
                .remove(key)
                .is_some_and(|feed| feed.send(Err(UpstreamError::Socket("reset by peer".to_string()))).is_ok())
        })
    }

    /// Close the live feed for `key` from the peer's side.
    pub fn close_from_peer(&self, key: &StreamKey) -> bool {
        self.with_state(|s| s.feeds.remove(key).is_some())
    }

    /// Refuse (or accept again) connect attempts for `key`.
    pub fn set_refused(&self, key: &StreamKey, refused: bool) {
        self.with_state(|s| {
            if refused {
                s.refused.insert(key.clone());
            } else {
                s.refused.remove(key);
            }
        });
    }

    /// Make connect attempts for `key` never complete.
    pub fn set_hanging(&self, key: &StreamKey, hanging: bool) {
        self.with_state(|s| {
            if hanging {
                s.hanging.insert(key.clone());
            } else {
                s.hanging.remove(key);
            }
        });
    }

    pub fn connects(&self, key: &StreamKey) -> usize {
        self.with_state(|s| s.connects.get(key).copied().unwrap_or(0))
    }

    /// Feeds for `key` that are open and not yet dropped.
    pub fn open_feeds(&self, key: &StreamKey) -> usize {
        self.with_state(|s| s.open.get(key).copied().unwrap_or(0))
    }

    pub fn total_open_feeds(&self) -> usize {
        self.with_state(|s| s.open.values().sum())
    }
}

#[async_trait]
impl UpstreamConnector for MockConnector {
    async fn connect(&self, key: &StreamKey) -> Result<Box<dyn TickSource>, UpstreamError> {
        let (refused, hanging) = self.with_state(|s| {
            *s.connects.entry(key.clone()).or_default() += 1;
            (s.refused.contains(key), s.hanging.contains(key))
        });
        if hanging {
            std::future::pending::<()>().await;
        }
        if refused {
            return Err(UpstreamError::Connect("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|s| {
            s.feeds.insert(key.clone(), tx);
            *s.open.entry(key.clone()).or_default() += 1;
        });
        Ok(Box::new(MockSource {
            key: key.clone(),
            rx,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSource {
    key: StreamKey,
    rx: mpsc::UnboundedReceiver<Result<Bar, UpstreamError>>,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl TickSource for MockSource {
    async fn next_bar(&mut self) -> Result<Option<Bar>, UpstreamError> {
        match self.rx.recv().await {
            Some(Ok(bar)) => Ok(Some(bar)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

impl Drop for MockSource {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(open) = state.open.get_mut(&self.key) {
            *open = open.saturating_sub(1);
        }
    }
}
