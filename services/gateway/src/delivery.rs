//! Delivery Gateway
//!
//! One actor owns every client session, their subscription sets and the
//! gateway-side demand. Socket tasks, the tick consumer and snapshot loads
//! talk to it through [`GatewayHandle`]; requests are handled in arrival
//! order, so ticks for a StreamKey reach each session in the order the
//! broker delivered them.
//!
//! - subscribe: add the key, send `start` on the first interest, load the
//!   window in the background, then deliver `historical_data` (or `error`)
//!   followed by `subscribed`.
//! - unsubscribe: remove the key, send `stop` on the last interest,
//!   acknowledge with `unsubscribed`.
//! - tick: encode once, queue for every subscribed session.
//! - disconnect: unsubscribe every key, close the outbox.
//!
//! A session whose outbox overflows under the disconnect policy goes through
//! the same disconnect path.

use std::sync::Arc;

use bus::TickMessage;
use rolling_cache::{CacheError, RollingCacheManager};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::bar::Bar;
use types::ids::SessionId;
use types::stream::StreamKey;

use crate::control::ControlPublisher;
use crate::demand::DemandTransition;
use crate::error::GatewayError;
use crate::protocol::ServerEvent;
use crate::session::{Outbox, OutboxError, SessionConfig, SessionRegistry, SubscribeError};
use crate::stats::{GatewaySnapshot, GatewayStats, SubscriptionCount};

enum Request {
    Connect {
        session: SessionId,
        reply: oneshot::Sender<Option<Arc<Outbox>>>,
    },
    Subscribe {
        session: SessionId,
        key: StreamKey,
    },
    Unsubscribe {
        session: SessionId,
        key: StreamKey,
    },
    Disconnect {
        session: SessionId,
    },
    Tick(TickMessage),
    SnapshotReady {
        session: SessionId,
        key: StreamKey,
        generation: u64,
        result: Result<Vec<Bar>, CacheError>,
    },
    Resync,
    Snapshot {
        reply: oneshot::Sender<GatewaySnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the delivery actor.
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::UnboundedSender<Request>,
    stats: Arc<GatewayStats>,
}

impl GatewayHandle {
    fn send(&self, request: Request) -> Result<(), GatewayError> {
        self.tx.send(request).map_err(|_| GatewayError::Stopped)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| GatewayError::Stopped)
    }

    /// Register a session and return the outbox its writer drains.
    pub async fn connect(&self, session: SessionId) -> Result<Arc<Outbox>, GatewayError> {
        self.call(|reply| Request::Connect { session, reply })
            .await?
            .ok_or_else(|| GatewayError::Protocol(format!("session {session} already connected")))
    }

    pub fn subscribe(&self, session: SessionId, key: StreamKey) -> Result<(), GatewayError> {
        self.send(Request::Subscribe { session, key })
    }

    pub fn unsubscribe(&self, session: SessionId, key: StreamKey) -> Result<(), GatewayError> {
        self.send(Request::Unsubscribe { session, key })
    }

    pub fn disconnect(&self, session: SessionId) -> Result<(), GatewayError> {
        self.send(Request::Disconnect { session })
    }

    /// Hand a broker tick to the actor for fan-out.
    pub fn tick(&self, tick: TickMessage) -> Result<(), GatewayError> {
        self.send(Request::Tick(tick))
    }

    /// Send `reset` for this gateway's origin followed by a `start` for every
    /// key with demand.
    pub fn resync(&self) -> Result<(), GatewayError> {
        self.send(Request::Resync)
    }

    pub async fn snapshot(&self) -> Result<GatewaySnapshot, GatewayError> {
        self.call(|reply| Request::Snapshot { reply }).await
    }

    /// Disconnect every session and stop the actor.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.call(|reply| Request::Shutdown { reply }).await
    }

    pub fn stats(&self) -> Arc<GatewayStats> {
        Arc::clone(&self.stats)
    }
}

pub struct DeliveryGateway {
    registry: SessionRegistry,
    cache: Arc<RollingCacheManager>,
    control: ControlPublisher,
    stats: Arc<GatewayStats>,
    session_config: SessionConfig,
    mailbox: mpsc::WeakUnboundedSender<Request>,
}

impl DeliveryGateway {
    /// Start the actor. It runs until `shutdown` is called or every handle is
    /// dropped.
    pub fn spawn(
        cache: Arc<RollingCacheManager>,
        control: ControlPublisher,
        session_config: SessionConfig,
    ) -> (GatewayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(GatewayStats::default());

        info!(
            origin = control.origin(),
            queue_capacity = session_config.queue_capacity,
            drop_policy = ?session_config.drop_policy,
            max_subscriptions = session_config.max_subscriptions,
            "DeliveryGateway initialized"
        );

        let actor = Self {
            registry: SessionRegistry::new(session_config.max_subscriptions),
            cache,
            control,
            stats: Arc::clone(&stats),
            session_config,
            mailbox: tx.downgrade(),
        };
        let task = tokio::spawn(actor.run(rx));
        (GatewayHandle { tx, stats }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = rx.recv().await {
            match request {
                Request::Connect { session, reply } => {
                    let _ = reply.send(self.connect(session));
                }
                Request::Subscribe { session, key } => self.subscribe(session, key),
                Request::Unsubscribe { session, key } => self.unsubscribe(session, key),
                Request::Disconnect { session } => self.disconnect(session),
                Request::Tick(tick) => self.on_tick(tick),
                Request::SnapshotReady {
                    session,
                    key,
                    generation,
                    result,
                } => self.on_snapshot(session, key, generation, result),
                Request::Resync => {
                    let keys = self.registry.demand().keys();
                    info!(streams = keys.len(), "Resyncing demand with the collector");
                    if let Err(e) = self.control.resync(&keys) {
                        warn!(error = %e, "Resync not sent");
                    }
                }
                Request::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Request::Shutdown { reply } => {
                    for session in self.registry.session_ids() {
                        self.disconnect(session);
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!("DeliveryGateway stopped");
    }

    fn connect(&mut self, session: SessionId) -> Option<Arc<Outbox>> {
        let outbox = Arc::new(Outbox::new(
            self.session_config.queue_capacity,
            self.session_config.drop_policy,
        ));
        if !self.registry.register(session, Arc::clone(&outbox)) {
            warn!(session = %session, "Duplicate session id");
            return None;
        }
        GatewayStats::incr(&self.stats.sessions_opened);
        info!(session = %session, clients = self.registry.session_count(), "Client connected");
        Some(outbox)
    }

    fn subscribe(&mut self, session: SessionId, key: StreamKey) {
        let subscription = match self.registry.subscribe(session, &key) {
            Ok(subscription) => subscription,
            Err(SubscribeError::UnknownSession) => {
                debug!(session = %session, stream = %key, "Subscribe from departed session");
                return;
            }
            Err(e) => {
                self.emit(session, ServerEvent::error(e.to_string()));
                return;
            }
        };

        info!(session = %session, stream = %key, added = subscription.added, "Subscribe");
        if let Some(transition) = subscription.transition {
            self.publish_transition(transition);
        }
        self.request_snapshot(session, key, subscription.generation);
    }

    fn unsubscribe(&mut self, session: SessionId, key: StreamKey) {
        match self.registry.unsubscribe(session, &key) {
            Ok(transition) => {
                info!(session = %session, stream = %key, "Unsubscribe");
                if let Some(transition) = transition {
                    self.publish_transition(transition);
                }
                self.emit(session, ServerEvent::unsubscribed(&key));
            }
            Err(_) => debug!(session = %session, stream = %key, "Unsubscribe from departed session"),
        }
    }

    fn disconnect(&mut self, session: SessionId) {
        let Some((departed, transitions)) = self.registry.disconnect(session) else {
            return;
        };
        departed.outbox.close();
        for transition in transitions {
            self.publish_transition(transition);
        }
        GatewayStats::incr(&self.stats.sessions_closed);
        info!(session = %session, clients = self.registry.session_count(), "Client disconnected");
    }

    fn publish_transition(&self, transition: DemandTransition) {
        let result = match &transition {
            DemandTransition::Started(key) => {
                info!(stream = %key, "First subscriber, requesting stream start");
                self.control.start(key)
            }
            DemandTransition::Stopped(key) => {
                info!(stream = %key, "No subscribers left, requesting stream stop");
                self.control.stop(key)
            }
        };
        if let Err(e) = result {
            warn!(error = %e, stream = %transition.key(), "Stream command not queued");
        }
    }

    fn request_snapshot(&self, session: SessionId, key: StreamKey, generation: u64) {
        let cache = Arc::clone(&self.cache);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = cache.fetch_or_load(&key).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(Request::SnapshotReady {
                    session,
                    key,
                    generation,
                    result,
                });
            }
        });
    }

    fn on_snapshot(&mut self, session: SessionId, key: StreamKey, generation: u64, result: Result<Vec<Bar>, CacheError>) {
        let Some(outbox) = self.registry.claim_snapshot(session, &key, generation) else {
            debug!(session = %session, stream = %key, "Discarding snapshot for a subscription that is gone");
            return;
        };

        let snapshot = match result {
            Ok(bars) => {
                GatewayStats::incr(&self.stats.snapshots_served);
                debug!(session = %session, stream = %key, bars = bars.len(), "Serving snapshot");
                ServerEvent::historical_data(&key, bars)
            }
            Err(e) => {
                GatewayStats::incr(&self.stats.snapshot_failures);
                warn!(session = %session, stream = %key, error = %e, "Snapshot fetch failed");
                ServerEvent::error(format!("Failed to load history for {key}: {e}"))
            }
        };

        for event in [snapshot, ServerEvent::subscribed(&key)] {
            if !self.push(session, &outbox, &event) {
                break;
            }
        }
    }

    fn on_tick(&mut self, tick: TickMessage) {
        GatewayStats::incr(&self.stats.ticks_received);
        let subscribers = self.registry.subscribers(&tick.key);
        if subscribers.is_empty() {
            return;
        }

        let payload = match ServerEvent::kline_update(&tick.key, tick.bar).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(stream = %tick.key, error = %e, "Dropping unencodable tick");
                return;
            }
        };

        let mut delivered = 0u64;
        let mut lagging = Vec::new();
        for session in subscribers {
            let Some(outbox) = self.registry.outbox(session) else {
                continue;
            };
            match outbox.push(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(OutboxError::Lagging(queued)) => lagging.push((session, queued)),
                Err(OutboxError::Closed) => {}
            }
        }
        GatewayStats::add(&self.stats.messages_delivered, delivered);

        for (session, queued) in lagging {
            warn!(session = %session, queued, "Disconnecting lagging client");
            GatewayStats::incr(&self.stats.lagging_disconnects);
            self.disconnect(session);
        }
    }

    /// Queue one event for a session, if it is still connected.
    fn emit(&mut self, session: SessionId, event: ServerEvent) {
        if let Some(outbox) = self.registry.outbox(session) {
            self.push(session, &outbox, &event);
        }
    }

    /// Returns `false` if the session is no longer reachable.
    fn push(&mut self, session: SessionId, outbox: &Outbox, event: &ServerEvent) -> bool {
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session = %session, error = %e, "Dropping unencodable event");
                return true;
            }
        };
        match outbox.push(payload) {
            Ok(()) => {
                GatewayStats::incr(&self.stats.messages_delivered);
                true
            }
            Err(OutboxError::Lagging(queued)) => {
                warn!(session = %session, queued, "Disconnecting lagging client");
                GatewayStats::incr(&self.stats.lagging_disconnects);
                self.disconnect(session);
                false
            }
            Err(OutboxError::Closed) => false,
        }
    }

    fn snapshot(&self) -> GatewaySnapshot {
        let subscription_counts = self
            .registry
            .demand()
            .counts()
            .into_iter()
            .map(|(key, count)| SubscriptionCount {
                subscription: key.cache_key(),
                count,
            })
            .collect();

        GatewaySnapshot {
            total_clients: self.registry.session_count(),
            active_subscriptions: self.registry.subscription_count(),
            total_subscription_groups: self.registry.demand().len(),
            subscription_counts,
        }
    }
}
