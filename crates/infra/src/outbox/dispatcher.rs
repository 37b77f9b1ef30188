//! Outbox dispatcher: drains unsent records into the message channel.
//!
//! One tick drains everything claimable, batch by batch:
//!
//! 1. Claim up to `batch_size` claimable records under this instance's lease
//! 2. Resolve each record's destination from its `event_type`
//! 3. Send with a bounded timeout
//! 4. Acked → `mark_sent` in its own short transaction
//! 5. Anything else → leave the record unsent
//! 6. Repeat until a claim comes back short
//!
//! Failed records keep their lease until the tick ends, so a later batch of
//! the same tick cannot pick them up again; their leases are released before
//! `tick` returns.
//!
//! There is no backoff and no attempt cutoff: an unsent record is retried on
//! every tick until it is delivered or purged by an operator. No lock is held
//! across the network call; `mark_sent` runs after `send` returns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use wallethub_events::{ChannelMessage, Delivery, MessageChannel, MessageHeaders};

use super::{DestinationRoutes, OutboxError, OutboxId, OutboxRecord, OutboxStore};
use crate::config::DispatcherConfig;

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
    pub unroutable: usize,
}

/// Cumulative counters of a running dispatcher.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub ticks: u64,
    pub tick_errors: u64,
    pub delivered: u64,
    pub failed: u64,
    pub unroutable: u64,
    pub uptime_secs: u64,
}

impl DispatcherStats {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.delivered += report.delivered as u64;
        self.failed += report.failed as u64;
        self.unroutable += report.unroutable as u64;
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for the current tick to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Background outbox dispatcher.
pub struct OutboxDispatcher<S, C> {
    store: S,
    channel: C,
    routes: DestinationRoutes,
    config: DispatcherConfig,
}

impl<S, C> OutboxDispatcher<S, C>
where
    S: OutboxStore + 'static,
    C: MessageChannel + 'static,
{
    pub fn new(store: S, channel: C, routes: DestinationRoutes, config: DispatcherConfig) -> Self {
        Self {
            store,
            channel,
            routes,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one dispatch pass synchronously.
    ///
    /// Only a failed claim is an error; per-record failures are counted in the
    /// report and leave the record for the next tick.
    pub fn tick(&self) -> Result<TickReport, OutboxError> {
        let mut report = TickReport::default();
        let mut tried = HashSet::new();
        let mut failed = Vec::new();

        let result = self.drain(&mut report, &mut tried, &mut failed);

        for id in failed {
            self.release(id);
        }

        if report.claimed > 0 {
            debug!(
                dispatcher = %self.config.name,
                claimed = report.claimed,
                delivered = report.delivered,
                failed = report.failed,
                unroutable = report.unroutable,
                "outbox tick finished"
            );
        }
        result.map(|()| report)
    }

    fn drain(
        &self,
        report: &mut TickReport,
        tried: &mut HashSet<OutboxId>,
        failed: &mut Vec<OutboxId>,
    ) -> Result<(), OutboxError> {
        loop {
            let records = self.store.claim_unsent(
                &self.config.instance_id,
                self.config.lease,
                self.config.batch_size,
            )?;
            let exhausted = records.len() < self.config.batch_size;

            // A lease shorter than the tick can hand back a record tried earlier.
            let fresh: Vec<OutboxRecord> = records
                .into_iter()
                .filter(|r| tried.insert(r.id))
                .collect();
            if fresh.is_empty() {
                return Ok(());
            }

            report.claimed += fresh.len();
            for record in fresh {
                if let Some(id) = self.dispatch_one(record, report) {
                    failed.push(id);
                }
            }

            if exhausted {
                return Ok(());
            }
        }
    }

    /// Returns the record's id when delivery failed and its lease should be
    /// released once the tick is over.
    fn dispatch_one(&self, record: OutboxRecord, report: &mut TickReport) -> Option<OutboxId> {
        let Some(destination) = self.routes.destination_for(&record.event_type) else {
            // Keep the lease: the record stays unsent and is retried once it expires.
            error!(
                outbox_id = %record.id,
                event_type = %record.event_type,
                "no destination for event type; record left unsent"
            );
            report.unroutable += 1;
            return None;
        };

        let id = record.id;
        let message = ChannelMessage::new(
            MessageHeaders {
                message_id: id.to_string(),
                event_type: record.event_type,
                correlation_id: record.correlation_id,
            },
            record.payload,
        );

        match self
            .channel
            .send(destination, message, self.config.delivery_timeout)
        {
            Ok(Delivery::Acked) => match self.store.mark_sent(id) {
                Ok(()) => {
                    report.delivered += 1;
                    None
                }
                Err(e) => {
                    // Delivered but not flagged: redelivered after the lease expires.
                    error!(outbox_id = %id, destination, error = %e, "failed to mark record sent");
                    report.failed += 1;
                    None
                }
            },
            Ok(Delivery::Rejected(reason)) => {
                warn!(outbox_id = %id, destination, reason = %reason, "delivery rejected");
                report.failed += 1;
                Some(id)
            }
            Err(e) => {
                warn!(outbox_id = %id, destination, error = %e, "delivery failed");
                report.failed += 1;
                Some(id)
            }
        }
    }

    fn release(&self, id: OutboxId) {
        if let Err(e) = self.store.release(id, &self.config.instance_id) {
            warn!(outbox_id = %id, error = %e, "failed to release outbox lease");
        }
    }

    /// Spawn the dispatcher on a named background thread.
    pub fn spawn(self) -> DispatcherHandle
    where
        S: Send,
        C: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || dispatcher_loop(self, shutdown_rx, stats_clone))
            .expect("failed to spawn outbox dispatcher thread");

        DispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn dispatcher_loop<S, C>(
    dispatcher: OutboxDispatcher<S, C>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<DispatcherStats>>,
) where
    S: OutboxStore + 'static,
    C: MessageChannel + 'static,
{
    let name = dispatcher.config.name.clone();
    let interval = dispatcher.config.poll_interval;
    info!(dispatcher = %name, interval_ms = interval.as_millis() as u64, "outbox dispatcher started");
    let start_time = Instant::now();

    loop {
        let result = dispatcher.tick();

        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.uptime_secs = start_time.elapsed().as_secs();
            match &result {
                Ok(report) => s.record(report),
                Err(_) => s.tick_errors += 1,
            }
        }

        if let Err(e) = result {
            error!(dispatcher = %name, error = %e, "outbox tick failed");
        }

        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(dispatcher = %name, "outbox dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::outbox::{InMemoryOutboxStore, NewOutboxRecord};
    use wallethub_events::InMemoryChannel;

    fn seed(store: &InMemoryOutboxStore, event_type: &str) -> OutboxId {
        store
            .insert(NewOutboxRecord {
                event_type: event_type.to_string(),
                payload: format!("{{\"type\":\"{event_type}\"}}"),
                correlation_id: Some("corr-1".to_string()),
            })
            .unwrap()
    }

    fn dispatcher(
        store: Arc<InMemoryOutboxStore>,
        channel: Arc<InMemoryChannel>,
    ) -> OutboxDispatcher<Arc<InMemoryOutboxStore>, Arc<InMemoryChannel>> {
        OutboxDispatcher::new(
            store,
            channel,
            DestinationRoutes::default(),
            DispatcherConfig::default().with_instance_id("test-dispatcher"),
        )
    }

    #[test]
    fn delivered_records_are_marked_sent() {
        let store = InMemoryOutboxStore::arc();
        let channel = Arc::new(InMemoryChannel::new());
        let id = seed(&store, "WalletCreated");

        let report = dispatcher(store.clone(), channel.clone()).tick().unwrap();

        assert_eq!(report, TickReport { claimed: 1, delivered: 1, failed: 0, unroutable: 0 });
        assert!(store.get(id).unwrap().unwrap().sent);

        let sent = channel.sent_to("wallet-created-topic");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(sent[0].headers.event_type, "WalletCreated");
        assert_eq!(sent[0].headers.message_id, id.to_string());
    }

    #[test]
    fn failed_delivery_leaves_record_unsent_and_retries_next_tick() {
        let store = InMemoryOutboxStore::arc();
        let channel = Arc::new(InMemoryChannel::new());
        let id = seed(&store, "FundsAdded");
        let dispatcher = dispatcher(store.clone(), channel.clone());

        channel.set_available(false);
        for _ in 0..3 {
            let report = dispatcher.tick().unwrap();
            assert_eq!(report.failed, 1);
            assert!(!store.get(id).unwrap().unwrap().sent);
        }

        channel.set_available(true);
        assert_eq!(dispatcher.tick().unwrap().delivered, 1);
        assert!(store.get(id).unwrap().unwrap().sent);
    }

    #[test]
    fn negative_ack_is_not_a_delivery() {
        let store = InMemoryOutboxStore::arc();
        let channel = Arc::new(InMemoryChannel::new());
        let id = seed(&store, "FundsWithdrawn");

        channel.set_rejecting(true);
        let report = dispatcher(store.clone(), channel).tick().unwrap();

        assert_eq!(report.failed, 1);
        assert!(!store.get(id).unwrap().unwrap().sent);
    }

    #[test]
    fn unroutable_records_stay_unsent() {
        let store = InMemoryOutboxStore::arc();
        let channel = Arc::new(InMemoryChannel::new());
        let id = seed(&store, "WalletArchived");

        let report = dispatcher(store.clone(), channel.clone()).tick().unwrap();

        assert_eq!(report.unroutable, 1);
        assert!(!store.get(id).unwrap().unwrap().sent);
        assert!(channel.sent().is_empty());
        assert_eq!(store.count_unsent().unwrap(), 1);
    }

    #[test]
    fn one_tick_drains_a_backlog_larger_than_a_batch() {
        let store = InMemoryOutboxStore::arc();
        let channel = Arc::new(InMemoryChannel::new());
        for _ in 0..150 {
            seed(&store, "WalletCreated");
        }

        let report = dispatcher(store.clone(), channel.clone()).tick().unwrap();

        assert_eq!(report, TickReport { claimed: 150, delivered: 150, failed: 0, unroutable: 0 });
        assert_eq!(store.count_unsent().unwrap(), 0);
        assert_eq!(channel.sent().len(), 150);
    }

    #[test]
    fn failed_records_are_tried_once_per_tick_then_released() {
        let store = InMemoryOutboxStore::arc();
        let channel = Arc::new(InMemoryChannel::new());
        for _ in 0..5 {
            seed(&store, "FundsAdded");
        }
        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            channel.clone(),
            DestinationRoutes::default(),
            DispatcherConfig::default()
                .with_instance_id("test-dispatcher")
                .with_batch_size(2),
        );

        channel.set_available(false);
        let report = dispatcher.tick().unwrap();

        assert_eq!((report.claimed, report.failed), (5, 5));
        let lease = DispatcherConfig::default().lease;
        assert_eq!(store.claim_unsent("other", lease, 10).unwrap().len(), 5);
    }

    #[test]
    fn concurrent_instances_never_claim_the_same_record() {
        let store = InMemoryOutboxStore::arc();
        for _ in 0..10 {
            seed(&store, "WalletCreated");
        }
        let lease = DispatcherConfig::default().lease;

        let claimed_a = store.claim_unsent("a", lease, 6).unwrap();
        let claimed_b = store.claim_unsent("b", lease, 6).unwrap();

        assert_eq!(claimed_a.len(), 6);
        assert_eq!(claimed_b.len(), 4);
        assert!(claimed_a.iter().all(|r| claimed_b.iter().all(|o| o.id != r.id)));
    }

    #[test]
    fn spawned_dispatcher_drains_and_shuts_down() {
        let store = InMemoryOutboxStore::arc();
        let channel = Arc::new(InMemoryChannel::new());
        seed(&store, "WalletCreated");
        seed(&store, "FundsAdded");

        let handle = OutboxDispatcher::new(
            store.clone(),
            channel.clone(),
            DestinationRoutes::default(),
            DispatcherConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .spawn();

        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.stats().delivered < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(handle.stats().delivered, 2);
        handle.shutdown();
        assert_eq!(store.count_unsent().unwrap(), 0);
        assert_eq!(channel.sent().len(), 2);
    }
}
