//! Rolling Cache Manager
//!
//! Read/write policy for rolling windows on top of a [`CacheStore`]:
//!
//! - `get_window` reads the cached window (absent or expired is a miss).
//! - `fetch_or_load` serves the cached window or loads history once per key,
//!   however many callers are waiting on it.
//! - `append` adds a closed bar to an existing window and refreshes its TTL.
//!
//! A failed load leaves nothing behind, so the next caller retries the loader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};
use types::bar::Bar;
use types::stream::StreamKey;

use crate::error::CacheError;
use crate::loader::HistoricalLoader;
use crate::store::CacheStore;
use crate::window::{PushOutcome, RollingWindow};

type LoadResult = Result<Arc<Vec<Bar>>, CacheError>;
type LoadFuture = Shared<BoxFuture<'static, LoadResult>>;

#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Maximum closed bars kept per stream.
    pub capacity: usize,
    pub ttl: Duration,
    /// Bars requested from the loader on a miss.
    pub history_limit: usize,
    pub load_timeout: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(3600),
            history_limit: 1000,
            load_timeout: Duration::from_secs(5),
        }
    }
}

/// What `append` did with a bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Open bar; windows only hold confirmed closes.
    NotClosed,
    /// Nothing cached for the stream yet. Windows are created by the first
    /// historical fetch.
    NoWindow,
    Appended { evicted: Option<Bar> },
    /// The window already holds a closed bar for this timestamp.
    Duplicate,
    Stale,
}

pub struct RollingCacheManager {
    store: Arc<dyn CacheStore>,
    loader: Arc<dyn HistoricalLoader>,
    config: WindowConfig,
    inflight: DashMap<String, (u64, LoadFuture)>,
    next_flight: AtomicU64,
    loads: Arc<AtomicU64>,
}

impl RollingCacheManager {
    pub fn new(
        store: Arc<dyn CacheStore>,
        loader: Arc<dyn HistoricalLoader>,
        config: WindowConfig,
    ) -> Self {
        Self {
            store,
            loader,
            config,
            inflight: DashMap::new(),
            next_flight: AtomicU64::new(1),
            loads: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Number of times the historical loader has been invoked.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Loads currently in flight.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Cached window for `key`, or `None` on a miss.
    ///
    /// An entry that no longer decodes is reported as a miss.
    pub async fn get_window(&self, key: &StreamKey) -> Result<Option<Vec<Bar>>, CacheError> {
        Ok(read_window(self.store.as_ref(), key)
            .await?
            .map(RollingWindow::into_bars))
    }

    /// Cached window, or history from the loader stored with the TTL.
    ///
    /// Concurrent callers for one key share a single loader call.
    pub async fn fetch_or_load(&self, key: &StreamKey) -> Result<Vec<Bar>, CacheError> {
        match self.get_window(key).await {
            Ok(Some(bars)) => return Ok(bars),
            Ok(None) => {}
            Err(e) => warn!(stream = %key, error = %e, "Cache read failed, loading history"),
        }

        let cache_key = key.cache_key();
        let (flight_id, flight) = {
            let entry = self.inflight.entry(cache_key.clone()).or_insert_with(|| {
                let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                (id, self.start_load(key.clone()))
            });
            (entry.0, entry.1.clone())
        };

        let result = flight.await;
        self.inflight
            .remove_if(&cache_key, |_, (id, _)| *id == flight_id);

        result.map(|bars| bars.as_ref().clone())
    }

    /// Append a closed bar to the cached window and refresh its TTL.
    pub async fn append(&self, key: &StreamKey, bar: Bar) -> Result<AppendOutcome, CacheError> {
        if !bar.closed {
            return Ok(AppendOutcome::NotClosed);
        }

        let Some(mut window) = read_window(self.store.as_ref(), key).await? else {
            return Ok(AppendOutcome::NoWindow);
        };

        let outcome = match window.push_closed(bar, self.config.capacity) {
            PushOutcome::Stale => return Ok(AppendOutcome::Stale),
            PushOutcome::Duplicate => return Ok(AppendOutcome::Duplicate),
            PushOutcome::Appended { evicted } => AppendOutcome::Appended { evicted },
        };

        write_window(self.store.as_ref(), key, &window, self.config.ttl).await?;
        debug!(stream = %key, size = window.len(), "Appended closed bar");
        Ok(outcome)
    }

    fn start_load(&self, key: StreamKey) -> LoadFuture {
        let store = Arc::clone(&self.store);
        let loader = Arc::clone(&self.loader);
        let loads = Arc::clone(&self.loads);
        let config = self.config.clone();

        async move {
            // A flight that finished just before this one started may already
            // have populated the store.
            if let Ok(Some(window)) = read_window(store.as_ref(), &key).await {
                return Ok(Arc::new(window.into_bars()));
            }

            loads.fetch_add(1, Ordering::Relaxed);
            let history = tokio::time::timeout(
                config.load_timeout,
                loader.load_history(&key, config.history_limit),
            )
            .await
            .map_err(|_| CacheError::LoadTimeout {
                key: key.cache_key(),
                timeout_ms: config.load_timeout.as_millis() as u64,
            })??;

            let window = RollingWindow::from_history(history, config.capacity);
            if let Err(e) = write_window(store.as_ref(), &key, &window, config.ttl).await {
                warn!(stream = %key, error = %e, "Loaded history could not be cached");
            }
            info!(stream = %key, bars = window.len(), "Loaded history into rolling window");
            Ok(Arc::new(window.into_bars()))
        }
        .boxed()
        .shared()
    }
}

async fn read_window(store: &dyn CacheStore, key: &StreamKey) -> Result<Option<RollingWindow>, CacheError> {
    let Some(raw) = store.get(&key.cache_key()).await? else {
        return Ok(None);
    };
    match serde_json::from_str::<RollingWindow>(&raw) {
        Ok(window) => Ok(Some(window)),
        Err(e) => {
            warn!(stream = %key, error = %e, "Discarding undecodable cache entry");
            Ok(None)
        }
    }
}

async fn write_window(
    store: &dyn CacheStore,
    key: &StreamKey,
    window: &RollingWindow,
    ttl: Duration,
) -> Result<(), CacheError> {
    let encoded = serde_json::to_string(window).map_err(|e| CacheError::Encode {
        key: key.cache_key(),
        reason: e.to_string(),
    })?;
    store.set_with_ttl(&key.cache_key(), encoded, ttl).await
}
