use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use rust_decimal::Decimal;
use wallethub_core::{AggregateRoot, Amount, CorrelationId, UserId};
use wallethub_events::{InMemoryChannel, SagaEvent};
use wallethub_infra::config::DispatcherConfig;
use wallethub_infra::outbox::{DestinationRoutes, OutboxDispatcher};
use wallethub_infra::saga::{InMemorySagaStore, SagaStateMachine};
use wallethub_infra::unit_of_work::InMemoryDatabase;
use wallethub_infra::wallet_service::WalletService;

fn seeded(records: usize) -> Arc<InMemoryDatabase> {
    let db = InMemoryDatabase::arc();
    let service = WalletService::new(db.clone());
    for _ in 0..records {
        service
            .create_wallet(UserId::new(), None)
            .expect("seed wallet");
    }
    db
}

fn bench_dispatcher_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatcher_tick");

    for batch in [10usize, 100, 500] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    let db = seeded(batch);
                    OutboxDispatcher::new(
                        db.outbox(),
                        Arc::new(InMemoryChannel::new()),
                        DestinationRoutes::default(),
                        DispatcherConfig::default().with_batch_size(batch),
                    )
                },
                |dispatcher| black_box(dispatcher.tick().expect("tick")),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_wallet_use_case(c: &mut Criterion) {
    let mut group = c.benchmark_group("wallet_use_case");
    let service = WalletService::new(InMemoryDatabase::arc());
    let (wallet, _) = service
        .create_wallet(UserId::new(), None)
        .expect("wallet");
    let one = Amount::new(Decimal::ONE).expect("amount");

    group.bench_function("add_funds_with_outbox_record", |b| {
        b.iter(|| {
            black_box(
                service
                    .add_funds(*wallet.id(), one, None)
                    .expect("add funds"),
            )
        })
    });

    group.finish();
}

fn bench_saga_transitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("saga_transitions");

    group.bench_function("full_happy_path", |b| {
        let machine = SagaStateMachine::new(InMemorySagaStore::arc());
        b.iter(|| {
            let id = CorrelationId::generate();
            for event in [
                SagaEvent::WalletCreated,
                SagaEvent::FundsAdded,
                SagaEvent::FundsWithdrawn,
                SagaEvent::FundsTransferred,
                SagaEvent::SagaCompleted,
            ] {
                black_box(machine.apply_event(&id, event).expect("apply"));
            }
        })
    });

    group.bench_function("duplicate_rejection", |b| {
        let machine = SagaStateMachine::new(InMemorySagaStore::arc());
        let id = CorrelationId::generate();
        machine
            .apply_event(&id, SagaEvent::WalletCreated)
            .expect("apply");
        b.iter(|| black_box(machine.apply_event(&id, SagaEvent::WalletCreated).expect("apply")))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_dispatcher_tick,
    bench_wallet_use_case,
    bench_saga_transitions
);
criterion_main!(benches);
