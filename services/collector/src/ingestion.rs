//! Ingestion Manager
//!
//! A single actor owns every upstream connection and the ingestion-side
//! demand counts. Requests (control commands, lifecycle events from
//! connection tasks, reconnect timers) arrive on one mailbox and are handled
//! in order, so no state here is shared or locked.
//!
//! Each connection runs in its own task and is the only writer for its
//! StreamKey: it appends closed bars to the rolling window and then publishes
//! every bar, in the order the upstream delivered them. While the socket
//! connects, the task makes sure a window exists for the key (loading
//! history on a miss) so the first closed bar has somewhere to go.
//!
//! Lifecycle events carry the epoch of the connection that produced them.
//! Events from a superseded connection are ignored.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bus::{Broker, TickMessage};
use rolling_cache::RollingCacheManager;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::bar::Bar;
use types::command::StreamCommand;
use types::stream::StreamKey;

use crate::demand::{ApplyOutcome, DemandChange, IngestionDemand};
use crate::error::{IngestionError, UpstreamError};
use crate::stats::IngestionStats;
use crate::upstream::{connect_with_timeout, ConnectionEvent, ConnectionState, UpstreamConnector};

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    pub key: StreamKey,
    pub state: ConnectionState,
    pub demand: u64,
    pub reconnects: u64,
    pub reconnect_pending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionSnapshot {
    pub streams: Vec<StreamStatus>,
    pub demand: BTreeMap<StreamKey, u64>,
    pub pending_reconnects: usize,
    /// Streams whose socket exists or is being opened or torn down.
    pub live_connections: usize,
}

impl IngestionSnapshot {
    pub fn state_of(&self, key: &StreamKey) -> Option<ConnectionState> {
        self.streams.iter().find(|s| &s.key == key).map(|s| s.state)
    }
}

enum Request {
    Apply {
        command: StreamCommand,
        reply: oneshot::Sender<ApplyOutcome>,
    },
    Ensure {
        key: StreamKey,
        reply: oneshot::Sender<()>,
    },
    Release {
        key: StreamKey,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<IngestionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Lifecycle {
        key: StreamKey,
        epoch: u64,
        event: ConnectionEvent,
        error: Option<UpstreamError>,
    },
    ReconnectDue {
        key: StreamKey,
        epoch: u64,
    },
}

/// Cloneable front door to the ingestion actor.
#[derive(Clone)]
pub struct IngestionHandle {
    tx: mpsc::UnboundedSender<Request>,
    stats: Arc<IngestionStats>,
}

impl IngestionHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, IngestionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| IngestionError::Stopped)?;
        rx.await.map_err(|_| IngestionError::Stopped)
    }

    /// Apply a control command to the demand counts, ensuring or releasing
    /// streams whose demand crosses zero.
    pub async fn apply(&self, command: StreamCommand) -> Result<ApplyOutcome, IngestionError> {
        self.call(|reply| Request::Apply { command, reply }).await
    }

    /// Open the upstream connection for `key` if none exists.
    pub async fn ensure_stream(&self, key: StreamKey) -> Result<(), IngestionError> {
        self.call(|reply| Request::Ensure { key, reply }).await
    }

    /// Tear down the upstream connection for `key` if one exists.
    pub async fn release_stream(&self, key: StreamKey) -> Result<(), IngestionError> {
        self.call(|reply| Request::Release { key, reply }).await
    }

    pub async fn snapshot(&self) -> Result<IngestionSnapshot, IngestionError> {
        self.call(|reply| Request::Snapshot { reply }).await
    }

    /// Release every stream and stop the actor.
    pub async fn shutdown(&self) -> Result<(), IngestionError> {
        self.call(|reply| Request::Shutdown { reply }).await
    }

    pub fn stats(&self) -> Arc<IngestionStats> {
        Arc::clone(&self.stats)
    }
}

struct UpstreamEntry {
    state: ConnectionState,
    epoch: u64,
    /// Dropping this tells the connection task to close.
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    /// `ensure_stream` arrived while closing; reconnect once closed.
    reopen: bool,
    reconnects: u64,
}

/// Shared by every connection task.
#[derive(Clone)]
struct ConnectionContext {
    connector: Arc<dyn UpstreamConnector>,
    cache: Arc<RollingCacheManager>,
    broker: Arc<dyn Broker>,
    connect_timeout: Duration,
    stats: Arc<IngestionStats>,
    mailbox: mpsc::WeakUnboundedSender<Request>,
}

pub struct IngestionManager {
    entries: HashMap<StreamKey, UpstreamEntry>,
    demand: IngestionDemand,
    ctx: ConnectionContext,
    config: IngestionConfig,
    next_epoch: u64,
}

impl IngestionManager {
    /// Start the actor. It runs until `shutdown` is called or every handle
    /// is dropped.
    pub fn spawn(
        connector: Arc<dyn UpstreamConnector>,
        cache: Arc<RollingCacheManager>,
        broker: Arc<dyn Broker>,
        config: IngestionConfig,
    ) -> (IngestionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(IngestionStats::default());
        let ctx = ConnectionContext {
            connector,
            cache,
            broker,
            connect_timeout: config.connect_timeout,
            stats: Arc::clone(&stats),
            mailbox: tx.downgrade(),
        };

        info!(
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            reconnect_backoff_ms = config.reconnect_backoff.as_millis() as u64,
            "IngestionManager initialized"
        );

        let manager = Self {
            entries: HashMap::new(),
            demand: IngestionDemand::new(),
            ctx,
            config,
            next_epoch: 1,
        };
        let task = tokio::spawn(manager.run(rx));
        (IngestionHandle { tx, stats }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = rx.recv().await {
            match request {
                Request::Apply { command, reply } => {
                    let outcome = self.apply(&command);
                    let _ = reply.send(outcome);
                }
                Request::Ensure { key, reply } => {
                    self.ensure_stream(key);
                    let _ = reply.send(());
                }
                Request::Release { key, reply } => {
                    self.release_stream(&key);
                    let _ = reply.send(());
                }
                Request::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Request::Shutdown { reply } => {
                    self.release_all().await;
                    let _ = reply.send(());
                    return;
                }
                Request::Lifecycle { key, epoch, event, error } => {
                    self.on_lifecycle(key, epoch, event, error);
                }
                Request::ReconnectDue { key, epoch } => self.on_reconnect_due(key, epoch),
            }
        }
        self.release_all().await;
    }

    fn apply(&mut self, command: &StreamCommand) -> ApplyOutcome {
        let outcome = self.demand.apply(command);
        match &outcome {
            ApplyOutcome::Stale => IngestionStats::incr(&self.ctx.stats.commands_stale),
            ApplyOutcome::Applied(changes) => {
                IngestionStats::incr(&self.ctx.stats.commands_applied);
                for change in changes {
                    match change {
                        DemandChange::Activated(key) => {
                            info!(stream = %key, origin = command.origin(), "Demand started, ensuring stream");
                            self.ensure_stream(key.clone());
                        }
                        DemandChange::Deactivated(key) => {
                            info!(stream = %key, origin = command.origin(), "Demand dropped to zero, releasing stream");
                            self.release_stream(key);
                        }
                    }
                }
            }
        }
        if let Some(key) = command.stream_key() {
            debug!(
                stream = %key,
                action = command.action(),
                origin = command.origin(),
                demand = self.demand.count(&key),
                "Applied stream command"
            );
        }
        outcome
    }

    fn ensure_stream(&mut self, key: StreamKey) {
        let Some(entry) = self.entries.get_mut(&key) else {
            self.start_connection(key);
            return;
        };
        match (entry.state, entry.reconnect.is_some()) {
            (ConnectionState::Connecting | ConnectionState::Open, _) => {
                debug!(stream = %key, state = %entry.state, "Stream already live");
            }
            (ConnectionState::Closing, _) => entry.reopen = true,
            (ConnectionState::Faulted, true) => {
                debug!(stream = %key, "Reconnect already scheduled");
            }
            (ConnectionState::Faulted | ConnectionState::Closed, _) => self.start_connection(key),
        }
    }

    fn release_stream(&mut self, key: &StreamKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.reopen = false;
        if let Some(timer) = entry.reconnect.take() {
            timer.abort();
        }

        if entry.state == ConnectionState::Closing {
            return;
        }
        match entry.state.on(ConnectionEvent::CloseRequested) {
            Some(ConnectionState::Closing) => {
                entry.state = ConnectionState::Closing;
                entry.shutdown.take();
                info!(stream = %key, "Closing upstream connection");
            }
            _ => {
                self.entries.remove(key);
                info!(stream = %key, "Upstream stream released");
            }
        }
    }

    fn start_connection(&mut self, key: StreamKey) {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_connection(self.ctx.clone(), key.clone(), epoch, shutdown_rx));

        let entry = self.entries.entry(key.clone()).or_insert_with(|| UpstreamEntry {
            state: ConnectionState::Connecting,
            epoch,
            shutdown: None,
            task: None,
            reconnect: None,
            reopen: false,
            reconnects: 0,
        });
        entry.state = ConnectionState::Connecting;
        entry.epoch = epoch;
        entry.shutdown = Some(shutdown_tx);
        entry.task = Some(task);
        entry.reopen = false;
        if let Some(timer) = entry.reconnect.take() {
            timer.abort();
        }
        info!(stream = %key, epoch, "Connecting upstream");
    }

    fn on_lifecycle(&mut self, key: StreamKey, epoch: u64, event: ConnectionEvent, error: Option<UpstreamError>) {
        let demand = self.demand.count(&key);
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        if entry.epoch != epoch {
            debug!(stream = %key, epoch, current = entry.epoch, "Ignoring event from superseded connection");
            return;
        }
        let Some(next) = entry.state.on(event) else {
            debug!(stream = %key, state = %entry.state, ?event, "Ignoring lifecycle event");
            return;
        };
        entry.state = next;

        match next {
            ConnectionState::Open => {
                IngestionStats::incr(&self.ctx.stats.connects);
                info!(stream = %key, "Upstream connection open");
            }
            ConnectionState::Faulted => {
                entry.shutdown = None;
                entry.task = None;
                let reason = error.map(|e| e.to_string()).unwrap_or_default();
                if demand > 0 {
                    warn!(
                        stream = %key,
                        error = %reason,
                        backoff_ms = self.config.reconnect_backoff.as_millis() as u64,
                        "Upstream faulted, reconnect scheduled"
                    );
                    entry.reconnect = Some(schedule_reconnect(
                        self.ctx.mailbox.clone(),
                        key,
                        epoch,
                        self.config.reconnect_backoff,
                    ));
                } else {
                    warn!(stream = %key, error = %reason, "Upstream faulted with no demand, leaving closed");
                    self.entries.remove(&key);
                }
            }
            ConnectionState::Closed => {
                let reopen = entry.reopen;
                self.entries.remove(&key);
                info!(stream = %key, "Upstream connection closed");
                if reopen {
                    self.start_connection(key);
                }
            }
            ConnectionState::Connecting | ConnectionState::Closing => {}
        }
    }

    fn on_reconnect_due(&mut self, key: StreamKey, epoch: u64) {
        let demand = self.demand.count(&key);
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        if entry.epoch != epoch || entry.state != ConnectionState::Faulted {
            return;
        }
        entry.reconnect = None;

        if demand == 0 {
            self.entries.remove(&key);
            info!(stream = %key, "Demand gone before reconnect, leaving closed");
            return;
        }
        if entry.state.on(ConnectionEvent::Reconnect).is_some() {
            entry.reconnects += 1;
            IngestionStats::incr(&self.ctx.stats.reconnects);
            self.start_connection(key);
        }
    }

    fn snapshot(&self) -> IngestionSnapshot {
        let mut streams: Vec<StreamStatus> = self
            .entries
            .iter()
            .map(|(key, entry)| StreamStatus {
                key: key.clone(),
                state: entry.state,
                demand: self.demand.count(key),
                reconnects: entry.reconnects,
                reconnect_pending: entry.reconnect.is_some(),
            })
            .collect();
        streams.sort_by(|a, b| a.key.cmp(&b.key));

        IngestionSnapshot {
            pending_reconnects: streams.iter().filter(|s| s.reconnect_pending).count(),
            live_connections: streams.iter().filter(|s| s.state.is_live()).count(),
            streams,
            demand: self.demand.counts(),
        }
    }

    async fn release_all(&mut self) {
        let mut tasks = Vec::new();
        for (key, mut entry) in self.entries.drain() {
            if let Some(timer) = entry.reconnect.take() {
                timer.abort();
            }
            entry.shutdown.take();
            if let Some(task) = entry.task.take() {
                tasks.push((key, task));
            }
        }

        let grace = self.config.connect_timeout;
        for (key, task) in tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!(stream = %key, "Connection task did not stop in time");
            }
        }
        info!("All upstream connections released");
    }
}

fn schedule_reconnect(
    mailbox: mpsc::WeakUnboundedSender<Request>,
    key: StreamKey,
    epoch: u64,
    backoff: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        if let Some(tx) = mailbox.upgrade() {
            let _ = tx.send(Request::ReconnectDue { key, epoch });
        }
    })
}

fn report(ctx: &ConnectionContext, key: &StreamKey, epoch: u64, event: ConnectionEvent, error: Option<UpstreamError>) {
    if let Some(tx) = ctx.mailbox.upgrade() {
        let _ = tx.send(Request::Lifecycle {
            key: key.clone(),
            epoch,
            event,
            error,
        });
    }
}

async fn run_connection(ctx: ConnectionContext, key: StreamKey, epoch: u64, mut shutdown: oneshot::Receiver<()>) {
    let connect = async {
        let (source, ()) = tokio::join!(
            connect_with_timeout(ctx.connector.as_ref(), &key, ctx.connect_timeout),
            warm_window(&ctx, &key),
        );
        source
    };
    let mut source = tokio::select! {
        _ = &mut shutdown => {
            report(&ctx, &key, epoch, ConnectionEvent::Closed, None);
            return;
        }
        result = connect => match result {
            Ok(source) => source,
            Err(e) => {
                report(&ctx, &key, epoch, ConnectionEvent::Failed, Some(e));
                return;
            }
        },
    };
    report(&ctx, &key, epoch, ConnectionEvent::Opened, None);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if tokio::time::timeout(ctx.connect_timeout, source.close()).await.is_err() {
                    debug!(stream = %key, "Upstream close timed out");
                }
                drop(source);
                report(&ctx, &key, epoch, ConnectionEvent::Closed, None);
                return;
            }
            next = source.next_bar() => match next {
                Ok(Some(bar)) => handle_bar(&ctx, &key, bar).await,
                Ok(None) => {
                    drop(source);
                    report(&ctx, &key, epoch, ConnectionEvent::Failed, Some(UpstreamError::ClosedByPeer));
                    return;
                }
                Err(e) => {
                    drop(source);
                    report(&ctx, &key, epoch, ConnectionEvent::Failed, Some(e));
                    return;
                }
            },
        }
    }
}

/// Load history for `key` unless a window is already cached. A failure is
/// logged and counted; live bars still flow, and the next gateway fetch
/// retries the load.
async fn warm_window(ctx: &ConnectionContext, key: &StreamKey) {
    match ctx.cache.fetch_or_load(key).await {
        Ok(bars) => debug!(stream = %key, bars = bars.len(), "Rolling window ready"),
        Err(e) => {
            IngestionStats::incr(&ctx.stats.warmup_failures);
            warn!(stream = %key, error = %e, "Could not load history for stream");
        }
    }
}

/// Cache first (closed bars only), then publish every bar.
async fn handle_bar(ctx: &ConnectionContext, key: &StreamKey, bar: Bar) {
    IngestionStats::incr(&ctx.stats.ticks_received);

    if !bar.is_valid() {
        IngestionStats::incr(&ctx.stats.invalid_bars);
        warn!(stream = %key, ts = bar.timestamp, "Dropping bar with inconsistent OHLC values");
        return;
    }

    if bar.closed {
        IngestionStats::incr(&ctx.stats.closed_bars);
        match ctx.cache.append(key, bar.clone()).await {
            Ok(outcome) => debug!(stream = %key, ts = bar.timestamp, ?outcome, "Closed bar cached"),
            Err(e) => {
                IngestionStats::incr(&ctx.stats.cache_failures);
                warn!(stream = %key, error = %e, "Failed to append closed bar");
            }
        }
    }

    if let Err(e) = ctx.broker.publish_tick(&TickMessage::new(key.clone(), bar)).await {
        IngestionStats::incr(&ctx.stats.publish_failures);
        warn!(stream = %key, error = %e, "Failed to publish tick");
    }
}
