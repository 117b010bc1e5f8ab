//! In-process broker
//!
//! Tick fan-out uses a tokio `broadcast` channel filtered per subscription;
//! commands go through a FIFO queue. Every command ever sent is kept in a log
//! so callers can inspect what crossed the control channel. Collector
//! announcements ride a second broadcast channel. The broker can be switched
//! unavailable to exercise retry paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, warn};
use types::command::StreamCommand;

use crate::error::{BusError, BusResult};
use crate::presence::CollectorAnnouncement;
use crate::topic::{topic_matches, TickMessage};
use crate::{Broker, Delivery};

const TICK_CHANNEL_CAPACITY: usize = 4096;
const SUBSCRIBER_CAPACITY: usize = 1024;
const ANNOUNCEMENT_CAPACITY: usize = 16;

pub struct InMemoryBroker {
    ticks: RwLock<broadcast::Sender<TickMessage>>,
    announcements: RwLock<broadcast::Sender<CollectorAnnouncement>>,
    queue: Mutex<VecDeque<Delivery>>,
    notify: Notify,
    log: Mutex<Vec<StreamCommand>>,
    available: AtomicBool,
    next_receipt: AtomicU64,
    ticks_published: AtomicU64,
    poll_interval: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(250))
    }

    /// How long `receive_command` waits before reporting an idle poll.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        let (ticks, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let (announcements, _) = broadcast::channel(ANNOUNCEMENT_CAPACITY);
        Self {
            ticks: RwLock::new(ticks),
            announcements: RwLock::new(announcements),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            log: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            next_receipt: AtomicU64::new(1),
            ticks_published: AtomicU64::new(0),
            poll_interval,
        }
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Close every live subscription, as a dropped connection would.
    pub fn drop_subscriptions(&self) {
        let (fresh, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        *self.ticks.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        let (fresh, _) = broadcast::channel(ANNOUNCEMENT_CAPACITY);
        *self.announcements.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Every command sent so far, in send order.
    pub fn command_log(&self) -> Vec<StreamCommand> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Commands still waiting in the queue.
    pub fn pending_commands(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn ticks_published(&self) -> u64 {
        self.ticks_published.load(Ordering::Relaxed)
    }

    /// Number of live tick subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.ticks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .receiver_count()
    }

    /// Number of live announcement subscriptions.
    pub fn announcement_subscriber_count(&self) -> usize {
        self.announcements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .receiver_count()
    }

    fn ensure_available(&self) -> BusResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable("in-memory broker switched off".to_string()))
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish_tick(&self, tick: &TickMessage) -> BusResult<()> {
        self.ensure_available()?;
        self.ticks_published.fetch_add(1, Ordering::Relaxed);
        let sender = self.ticks.read().unwrap_or_else(PoisonError::into_inner);
        // No subscribers is not an error: the tick is simply unrouted.
        let _ = sender.send(tick.clone());
        Ok(())
    }

    async fn subscribe_ticks(&self, pattern: &str) -> BusResult<mpsc::Receiver<TickMessage>> {
        self.ensure_available()?;
        let mut source = self
            .ticks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(tick) => {
                        if topic_matches(&pattern, &tick.routing_key()) && tx.send(tick).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(pattern = %pattern, skipped, "Tick subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(pattern = %pattern, "Tick subscription closed");
        });

        Ok(rx)
    }

    async fn send_command(&self, command: &StreamCommand) -> BusResult<()> {
        self.ensure_available()?;
        let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed).to_string();
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Delivery::new(command.clone(), receipt));
        self.notify.notify_one();
        Ok(())
    }

    async fn receive_command(&self) -> BusResult<Option<Delivery>> {
        self.ensure_available()?;
        loop {
            let next = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if let Some(delivery) = next {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout(self.poll_interval, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack_command(&self, _delivery: &Delivery) -> BusResult<()> {
        // Deliveries are removed from the queue when handed out.
        Ok(())
    }

    async fn announce_collector(&self, announcement: &CollectorAnnouncement) -> BusResult<()> {
        self.ensure_available()?;
        let sender = self.announcements.read().unwrap_or_else(PoisonError::into_inner);
        let _ = sender.send(announcement.clone());
        Ok(())
    }

    async fn subscribe_announcements(&self) -> BusResult<mpsc::Receiver<CollectorAnnouncement>> {
        self.ensure_available()?;
        let mut source = self
            .announcements
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe();
        let (tx, rx) = mpsc::channel(ANNOUNCEMENT_CAPACITY);

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(announcement) => {
                        if tx.send(announcement).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Announcement subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Announcement subscription closed");
        });

        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
