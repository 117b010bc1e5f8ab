//! Control publisher
//!
//! Sends start/stop/reset commands to the collector's control queue from a
//! single task, in the order they were requested, so a `stop` can never
//! overtake the `start` it answers. Requests return immediately; while the
//! broker is unreachable the head command is retried and the rest wait
//! behind it.
//!
//! Every command is stamped with a sequence number from one counter that
//! starts at the current Unix time in milliseconds, so a restarted gateway
//! continues above the numbers its previous run used.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bus::Broker;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::command::StreamCommand;
use types::stream::StreamKey;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
enum Intent {
    Start { key: StreamKey, origin: String },
    Stop { key: StreamKey, origin: String },
    Reset { origin: String },
}

impl Intent {
    fn into_command(self, seq: u64) -> StreamCommand {
        match self {
            Intent::Start { key, origin } => StreamCommand::start(&key, origin, seq),
            Intent::Stop { key, origin } => StreamCommand::stop(&key, origin, seq),
            Intent::Reset { origin } => StreamCommand::reset(origin, seq),
        }
    }
}

enum ControlRequest {
    Send(Intent),
    Close { reply: oneshot::Sender<()> },
}

#[derive(Debug, Default)]
struct ControlCounters {
    sent: AtomicU64,
    failures: AtomicU64,
    queued: AtomicU64,
    /// Last send attempt succeeded.
    healthy: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlStatus {
    pub sent: u64,
    pub failures: u64,
    pub queued: u64,
    pub healthy: bool,
}

/// Cloneable handle to the publisher task.
#[derive(Clone)]
pub struct ControlPublisher {
    tx: mpsc::UnboundedSender<ControlRequest>,
    origin: Arc<str>,
    counters: Arc<ControlCounters>,
}

impl ControlPublisher {
    /// Start the publisher task for `origin`.
    ///
    /// After `shutdown` fires, each remaining command is attempted once
    /// instead of retried.
    pub fn spawn(
        broker: Arc<dyn Broker>,
        origin: impl Into<String>,
        retry: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(ControlCounters::default());
        let task = tokio::spawn(run_publisher(
            broker,
            rx,
            retry,
            shutdown,
            Arc::clone(&counters),
        ));
        let publisher = Self {
            tx,
            origin: Arc::from(origin.into()),
            counters,
        };
        (publisher, task)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn enqueue(&self, intent: Intent) -> Result<(), GatewayError> {
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.tx.send(ControlRequest::Send(intent)).map_err(|_| {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            GatewayError::ControlClosed
        })
    }

    pub fn start(&self, key: &StreamKey) -> Result<(), GatewayError> {
        self.start_as(key, &self.origin)
    }

    pub fn stop(&self, key: &StreamKey) -> Result<(), GatewayError> {
        self.stop_as(key, &self.origin)
    }

    /// Request a start under another origin (manual stream control).
    pub fn start_as(&self, key: &StreamKey, origin: &str) -> Result<(), GatewayError> {
        self.enqueue(Intent::Start {
            key: key.clone(),
            origin: origin.to_string(),
        })
    }

    pub fn stop_as(&self, key: &StreamKey, origin: &str) -> Result<(), GatewayError> {
        self.enqueue(Intent::Stop {
            key: key.clone(),
            origin: origin.to_string(),
        })
    }

    /// Clear everything the collector holds for this origin, then declare
    /// `keys` as the current demand.
    pub fn resync(&self, keys: &[StreamKey]) -> Result<(), GatewayError> {
        self.enqueue(Intent::Reset {
            origin: self.origin.to_string(),
        })?;
        keys.iter().try_for_each(|key| self.start(key))
    }

    /// Wait until every command requested so far has been handled, then stop
    /// the task.
    pub async fn close(&self) -> Result<(), GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlRequest::Close { reply })
            .map_err(|_| GatewayError::ControlClosed)?;
        rx.await.map_err(|_| GatewayError::ControlClosed)
    }

    pub fn status(&self) -> ControlStatus {
        ControlStatus {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            healthy: self.counters.healthy.load(Ordering::Relaxed),
        }
    }
}

fn initial_seq() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(1).max(1)
}

async fn run_publisher(
    broker: Arc<dyn Broker>,
    mut rx: mpsc::UnboundedReceiver<ControlRequest>,
    retry: Duration,
    mut shutdown: broadcast::Receiver<()>,
    counters: Arc<ControlCounters>,
) {
    let mut next_seq = initial_seq();
    let mut draining = false;
    info!(first_seq = next_seq, "Control publisher started");

    while let Some(request) = rx.recv().await {
        let intent = match request {
            ControlRequest::Send(intent) => intent,
            ControlRequest::Close { reply } => {
                let _ = reply.send(());
                break;
            }
        };

        let command = intent.into_command(next_seq);
        next_seq += 1;

        loop {
            match broker.send_command(&command).await {
                Ok(()) => {
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                    counters.healthy.store(true, Ordering::Relaxed);
                    info!(
                        action = command.action(),
                        origin = command.origin(),
                        seq = command.seq(),
                        stream = %command.stream_key().map(|k| k.to_string()).unwrap_or_default(),
                        "Stream command sent"
                    );
                    break;
                }
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    counters.healthy.store(false, Ordering::Relaxed);
                    if draining {
                        warn!(error = %e, action = command.action(), "Dropping stream command during shutdown");
                        break;
                    }
                    warn!(
                        error = %e,
                        action = command.action(),
                        retry_ms = retry.as_millis() as u64,
                        "Control queue unavailable, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => draining = true,
                        _ = tokio::time::sleep(retry) => {}
                    }
                }
            }
        }
        counters.queued.fetch_sub(1, Ordering::Relaxed);
    }

    debug!("Control publisher stopped");
}
