//! Integration tests for the full outbox + saga pipeline.
//!
//! Tests: WalletService → UnitOfWork → Outbox → Dispatcher → Channel → Consumer → Saga
//!
//! Verifies:
//! - Business changes and their outbox records commit or roll back together
//! - Records stay unsent until the channel acknowledges them
//! - Sagas advance in order, reject out-of-order and duplicate events, and
//!   fail when an envelope carries no correlation id

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use rust_decimal::Decimal;

    use wallethub_core::{AggregateRoot, Amount, CorrelationId, UserId};
    use wallethub_events::{
        ChannelMessage, InMemoryChannel, MessageHeaders, RejectionReason, SagaEvent, SagaState,
    };

    use crate::config::DispatcherConfig;
    use crate::consumers::{
        Consumed, FundsAddedConsumer, FundsTransferredConsumer, FundsWithdrawnConsumer,
        MessageConsumer, WalletCreatedConsumer,
    };
    use crate::outbox::{DestinationRoutes, InMemoryOutboxStore, OutboxDispatcher, OutboxStore};
    use crate::saga::{InMemorySagaStore, SagaOutcome, SagaStateMachine};
    use crate::unit_of_work::InMemoryDatabase;
    use crate::wallet_service::{ServiceError, WalletService};
    use crate::workers::ConsumerWorker;

    type Machine = Arc<SagaStateMachine<Arc<InMemorySagaStore>>>;
    type Dispatcher = OutboxDispatcher<Arc<InMemoryOutboxStore>, Arc<InMemoryChannel>>;

    struct Harness {
        service: WalletService<Arc<InMemoryDatabase>>,
        channel: Arc<InMemoryChannel>,
        dispatcher: Dispatcher,
        machine: Machine,
        consumers: Vec<Box<dyn MessageConsumer>>,
    }

    impl Harness {
        fn new() -> Self {
            let db = InMemoryDatabase::arc();
            let channel = Arc::new(InMemoryChannel::new());
            let dispatcher = OutboxDispatcher::new(
                db.outbox(),
                channel.clone(),
                DestinationRoutes::default(),
                DispatcherConfig::default().with_instance_id("relay-a"),
            );
            let machine: Machine = Arc::new(SagaStateMachine::new(InMemorySagaStore::arc()));
            let consumers: Vec<Box<dyn MessageConsumer>> = vec![
                Box::new(WalletCreatedConsumer::new(machine.clone())),
                Box::new(FundsAddedConsumer::new(machine.clone())),
                Box::new(FundsWithdrawnConsumer::new(machine.clone())),
                Box::new(FundsTransferredConsumer::new(machine.clone())),
            ];

            Self {
                service: WalletService::new(db),
                channel,
                dispatcher,
                machine,
                consumers,
            }
        }

        fn db(&self) -> &Arc<InMemoryDatabase> {
            self.service.database()
        }

        /// Feed one delivered message to the consumer for its event type.
        fn consume(&self, message: &ChannelMessage) -> Consumed {
            self.consumers
                .iter()
                .find(|c| c.event_type() == message.headers.event_type)
                .expect("consumer for event type")
                .consume(message)
                .unwrap()
        }

        /// Dispatch everything pending and consume what was delivered by this tick.
        fn pump(&self) -> Vec<Consumed> {
            let before = self.channel.sent().len();
            self.dispatcher.tick().unwrap();
            self.channel.sent()[before..]
                .iter()
                .map(|(_, message)| self.consume(message))
                .collect()
        }

        fn state(&self, raw: &str) -> Option<SagaState> {
            self.machine.state(&corr(raw)).unwrap()
        }
    }

    fn corr(raw: &str) -> CorrelationId {
        CorrelationId::parse(raw).unwrap()
    }

    fn amount(v: i64) -> Amount {
        Amount::new(Decimal::from(v)).unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn saga_walks_the_happy_path_to_completed() {
        let h = Harness::new();
        let c = Some(corr("corr-1"));

        let (a, _) = h.service.create_wallet(UserId::new(), c.clone()).unwrap();
        h.pump();
        assert_eq!(h.state("corr-1"), Some(SagaState::WalletCreated));

        let (b, _) = h.service.create_wallet(UserId::new(), Some(corr("corr-2"))).unwrap();
        h.service.add_funds(*a.id(), amount(100), c.clone()).unwrap();
        h.pump();
        assert_eq!(h.state("corr-1"), Some(SagaState::FundsAdded));

        h.service.withdraw_funds(*a.id(), amount(10), c.clone()).unwrap();
        h.pump();
        assert_eq!(h.state("corr-1"), Some(SagaState::FundsWithdrawn));

        h.service.transfer_funds(*a.id(), *b.id(), amount(40), c).unwrap();
        h.pump();
        assert_eq!(h.state("corr-1"), Some(SagaState::Completed));

        assert_eq!(h.db().outbox().count_unsent().unwrap(), 0);
        assert_eq!(h.db().wallet(*a.id()).unwrap().balance(), Decimal::from(50));
        assert_eq!(h.db().wallet(*b.id()).unwrap().balance(), Decimal::from(40));
        assert_eq!(
            h.channel.sent_to("wallet-created-topic")[0].headers.correlation_id.as_deref(),
            Some("corr-1")
        );
    }

    #[test]
    fn failed_outbox_insert_leaves_no_trace() {
        let h = Harness::new();
        let (wallet, _) = h.service.create_wallet(UserId::new(), Some(corr("c"))).unwrap();

        h.db().fail_outbox_inserts(true);
        let err = h
            .service
            .add_funds(*wallet.id(), amount(25), Some(corr("c")))
            .unwrap_err();

        assert!(matches!(err, ServiceError::Publish(_)));
        assert_eq!(h.db().wallet(*wallet.id()).unwrap().balance(), Decimal::ZERO);
        assert_eq!(h.db().outbox().all().unwrap().len(), 1);
    }

    #[test]
    fn channel_outage_keeps_records_unsent_until_it_recovers() {
        let h = Harness::new();
        h.service.create_wallet(UserId::new(), Some(corr("c"))).unwrap();

        h.channel.set_available(false);
        let report = h.dispatcher.tick().unwrap();
        assert_eq!((report.claimed, report.failed, report.delivered), (1, 1, 0));
        assert_eq!(h.db().outbox().count_unsent().unwrap(), 1);
        assert!(h.channel.sent().is_empty());

        h.channel.set_available(true);
        let report = h.dispatcher.tick().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(h.db().outbox().count_unsent().unwrap(), 0);

        let record = &h.db().outbox().all().unwrap()[0];
        assert!(record.sent);
        assert!(record.sent_at.is_some());
    }

    #[test]
    fn rejected_delivery_is_retried() {
        let h = Harness::new();
        h.service.create_wallet(UserId::new(), Some(corr("c"))).unwrap();

        h.channel.set_rejecting(true);
        assert_eq!(h.dispatcher.tick().unwrap().failed, 1);
        h.channel.set_rejecting(false);
        assert_eq!(h.dispatcher.tick().unwrap().delivered, 1);
    }

    #[test]
    fn missing_correlation_id_fails_a_synthetic_saga() {
        let h = Harness::new();
        let (wallet, _) = h.service.create_wallet(UserId::new(), Some(corr("c"))).unwrap();
        h.pump();

        h.service.add_funds(*wallet.id(), amount(5), None).unwrap();
        let consumed = h.pump();

        assert_eq!(consumed.len(), 1);
        let Consumed::ForcedFailure { correlation_id, outcome, .. } = &consumed[0] else {
            panic!("expected forced failure, got {:?}", consumed[0]);
        };
        assert!(correlation_id.is_synthetic());
        assert_eq!(outcome.state(), SagaState::Failed);
        // The real saga is untouched.
        assert_eq!(h.state("c"), Some(SagaState::WalletCreated));
    }

    #[test]
    fn out_of_order_event_is_rejected_and_nothing_is_stored() {
        let h = Harness::new();
        let id = corr("early");

        let outcome = h.machine.apply_event(&id, SagaEvent::FundsAdded).unwrap();

        let SagaOutcome::Rejected(rejection) = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.state, SagaState::Initial);
        assert_eq!(rejection.reason, RejectionReason::OutOfOrder);
        assert_eq!(h.state("early"), None);
    }

    #[test]
    fn redelivered_message_is_a_duplicate() {
        let h = Harness::new();
        h.service.create_wallet(UserId::new(), Some(corr("dup"))).unwrap();
        h.pump();

        let (_, message) = h.channel.sent()[0].clone();
        let again = h.consume(&message);

        let SagaOutcome::Rejected(rejection) = again.outcome() else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.reason, RejectionReason::Duplicate);
        let instance = h.machine.instance(&corr("dup")).unwrap().unwrap();
        assert_eq!(instance.version(), 1);
    }

    #[test]
    fn crash_before_mark_sent_redelivers_as_a_duplicate() {
        let h = Harness::new();
        h.service.create_wallet(UserId::new(), Some(corr("crash"))).unwrap();

        // Instance "relay-a" claims and delivers, then dies before marking the record sent.
        let claimed = h
            .db()
            .outbox()
            .claim_unsent("relay-a", Duration::from_millis(50), 10)
            .unwrap();
        assert_eq!(claimed.len(), 1);
        let record = claimed[0].clone();
        let first = h.consume(&ChannelMessage::new(
            MessageHeaders {
                message_id: record.id.to_string(),
                event_type: record.event_type.clone(),
                correlation_id: record.correlation_id.clone(),
            },
            record.payload.clone(),
        ));
        assert!(first.outcome().is_transitioned());

        let restarted = OutboxDispatcher::new(
            h.db().outbox(),
            h.channel.clone(),
            DestinationRoutes::default(),
            DispatcherConfig::default().with_instance_id("relay-b"),
        );
        assert_eq!(restarted.tick().unwrap().claimed, 0);

        thread::sleep(Duration::from_millis(80));
        let report = restarted.tick().unwrap();
        assert_eq!((report.claimed, report.delivered), (1, 1));

        let (_, redelivered) = h.channel.sent()[0].clone();
        assert_eq!(redelivered.headers.message_id, record.id.to_string());
        let again = h.consume(&redelivered);

        let SagaOutcome::Rejected(rejection) = again.outcome() else {
            panic!("expected rejection, got {again:?}");
        };
        assert_eq!(rejection.reason, RejectionReason::Duplicate);
        assert_eq!(h.state("crash"), Some(SagaState::WalletCreated));
        assert_eq!(h.db().outbox().count_unsent().unwrap(), 0);
    }

    #[test]
    fn terminal_saga_ignores_later_events() {
        let h = Harness::new();
        let id = corr("done");
        h.machine.apply_event(&id, SagaEvent::WalletCreated).unwrap();
        h.machine.apply_event(&id, SagaEvent::SagaFailed).unwrap();

        let outcome = h.machine.apply_event(&id, SagaEvent::FundsAdded).unwrap();

        assert!(matches!(
            outcome,
            SagaOutcome::Rejected(ref r) if r.reason == RejectionReason::Terminal
        ));
        assert_eq!(h.state("done"), Some(SagaState::Failed));
    }

    #[test]
    fn competing_dispatchers_deliver_each_record_once() {
        let db = InMemoryDatabase::arc();
        let service = WalletService::new(db.clone());
        for _ in 0..20 {
            service.create_wallet(UserId::new(), None).unwrap();
        }

        let channel = Arc::new(InMemoryChannel::new());
        let make = |instance: &str| {
            OutboxDispatcher::new(
                db.outbox(),
                channel.clone(),
                DestinationRoutes::default(),
                DispatcherConfig::default()
                    .with_instance_id(instance)
                    .with_batch_size(7),
            )
        };
        let a = make("relay-a");
        let b = make("relay-b");

        while db.outbox().count_unsent().unwrap() > 0 {
            a.tick().unwrap();
            b.tick().unwrap();
        }

        let ids: Vec<String> = channel
            .sent()
            .into_iter()
            .map(|(_, m)| m.headers.message_id)
            .collect();
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(ids.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[test]
    fn background_pipeline_completes_a_saga() {
        let db = InMemoryDatabase::arc();
        let service = WalletService::new(db.clone());
        let channel = Arc::new(InMemoryChannel::new());
        let machine: Machine = Arc::new(SagaStateMachine::new(InMemorySagaStore::arc()));

        let workers = vec![
            ConsumerWorker::spawn(
                "wallet-created-consumer",
                &channel,
                "wallet-created-topic",
                WalletCreatedConsumer::new(machine.clone()),
            ),
            ConsumerWorker::spawn(
                "funds-added-consumer",
                &channel,
                "funds-added-topic",
                FundsAddedConsumer::new(machine.clone()),
            ),
            ConsumerWorker::spawn(
                "funds-withdrawn-consumer",
                &channel,
                "funds-withdrawn-topic",
                FundsWithdrawnConsumer::new(machine.clone()),
            ),
            ConsumerWorker::spawn(
                "funds-transferred-consumer",
                &channel,
                "funds-transferred-topic",
                FundsTransferredConsumer::new(machine.clone()),
            ),
        ];

        let dispatcher = OutboxDispatcher::new(
            db.outbox(),
            channel.clone(),
            DestinationRoutes::default(),
            DispatcherConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .spawn();

        let id = corr("bg-1");
        let state = || machine.state(&id).unwrap();

        // Each step waits for the previous one; the saga only accepts them in order.
        let (a, _) = service.create_wallet(UserId::new(), Some(id.clone())).unwrap();
        let (b, _) = service.create_wallet(UserId::new(), None).unwrap();
        wait_until(|| state() == Some(SagaState::WalletCreated));

        service.add_funds(*a.id(), amount(10), Some(id.clone())).unwrap();
        wait_until(|| state() == Some(SagaState::FundsAdded));

        service.withdraw_funds(*a.id(), amount(3), Some(id.clone())).unwrap();
        wait_until(|| state() == Some(SagaState::FundsWithdrawn));

        service.transfer_funds(*a.id(), *b.id(), amount(2), Some(id.clone())).unwrap();
        wait_until(|| state() == Some(SagaState::Completed));

        wait_until(|| db.outbox().count_unsent().unwrap() == 0);

        dispatcher.shutdown();
        for worker in workers {
            worker.shutdown();
        }
    }
}
