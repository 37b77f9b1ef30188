use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use wallethub_events::{ChannelMessage, MessageChannel, Subscription};

use crate::consumers::{Consumed, ConsumerError, MessageConsumer};

/// How long a worker blocks on its subscription before checking for shutdown.
const POLL: Duration = Duration::from_millis(250);

/// Counters shared between a worker thread and its handle.
#[derive(Debug, Default)]
pub struct WorkerStats {
    consumed: AtomicU64,
    forced_failures: AtomicU64,
    errors: AtomicU64,
}

impl WorkerStats {
    /// Messages that reached the state machine (accepted or rejected).
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Messages that forced their saga into `Failed`.
    pub fn forced_failures(&self) -> u64 {
        self.forced_failures.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Consumer worker loop.
///
/// - Subscribes to one destination
/// - Hands every message to a [`MessageConsumer`]
/// - Acknowledges a message only once the consumer settled it; a message
///   whose saga update failed stays unacknowledged and comes back later
/// - Delivery is at-least-once and the state machine absorbs the duplicates
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Spawn a worker thread consuming `destination` from `channel`.
    ///
    /// The subscription is taken before this returns, so messages sent
    /// afterwards are not missed.
    pub fn spawn<C, K>(
        name: impl Into<String>,
        channel: &C,
        destination: &str,
        consumer: K,
    ) -> WorkerHandle
    where
        C: MessageChannel + ?Sized,
        K: MessageConsumer + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let subscription = channel.subscribe(destination);
        let stats = Arc::new(WorkerStats::default());

        let worker_name = name.clone();
        let worker_stats = stats.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                worker_loop(&worker_name, subscription, shutdown_rx, &consumer, &worker_stats)
            })
            .expect("failed to spawn consumer worker thread");

        WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn worker_loop<K: MessageConsumer>(
    name: &str,
    subscription: Subscription<ChannelMessage>,
    shutdown_rx: mpsc::Receiver<()>,
    consumer: &K,
    stats: &WorkerStats,
) {
    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match subscription.recv_timeout(POLL) {
            Ok(message) => {
                if handle(name, consumer, &message, stats) {
                    subscription.ack(&message);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!(worker = name, "subscription closed");
                break;
            }
        }
    }
}

/// Returns whether the message is settled and can be acknowledged.
fn handle<K: MessageConsumer>(
    name: &str,
    consumer: &K,
    message: &ChannelMessage,
    stats: &WorkerStats,
) -> bool {
    match consumer.consume(message) {
        Ok(Consumed::Applied { .. }) => {
            stats.consumed.fetch_add(1, Ordering::Relaxed);
            true
        }
        Ok(Consumed::ForcedFailure { .. }) => {
            stats.consumed.fetch_add(1, Ordering::Relaxed);
            stats.forced_failures.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(err @ ConsumerError::UnexpectedEventType { .. }) => {
            // Redelivery would land on this consumer again.
            stats.errors.fetch_add(1, Ordering::Relaxed);
            error!(
                worker = name,
                message_id = %message.headers.message_id,
                error = %err,
                "message routed to the wrong consumer"
            );
            true
        }
        Err(err) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = name,
                message_id = %message.headers.message_id,
                error = %err,
                "consumer failed; message left unacknowledged"
            );
            false
        }
    }
}
