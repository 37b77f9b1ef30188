//! `wallethub-relay`: outbox dispatcher plus saga consumers.
//!
//! Startup: config → Postgres pool → schema → stores → Redis channel →
//! consumer workers → dispatcher. Ctrl-C stops the dispatcher first, then the
//! readers and workers.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;

use wallethub_infra::channel::RedisStreamsChannel;
use wallethub_infra::config::RelayConfig;
use wallethub_infra::consumers::{
    EventConsumer, FundsAddedConsumer, FundsTransferredConsumer, FundsWithdrawnConsumer,
    WalletCreatedConsumer,
};
use wallethub_infra::outbox::{DestinationRoutes, OutboxDispatcher, PostgresOutboxStore};
use wallethub_infra::pg;
use wallethub_infra::saga::{PostgresSagaStore, SagaStateMachine};
use wallethub_infra::workers::{ConsumerWorker, WorkerHandle};

type Machine = Arc<SagaStateMachine<PostgresSagaStore>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wallethub_observability::init();

    let config = RelayConfig::from_env().context("loading relay configuration")?;
    tracing::info!(
        instance_id = %config.dispatcher.instance_id,
        consumer_group = %config.consumer_group,
        consumer_name = %config.consumer_name,
        routes = ?config.routes.iter().collect::<Vec<_>>(),
        "starting relay"
    );

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;
    pg::ensure_schema(&pool).await.context("creating schema")?;

    let handle = Handle::current();
    let outbox = PostgresOutboxStore::new(pool.clone(), handle.clone());
    let machine: Machine = Arc::new(SagaStateMachine::new(PostgresSagaStore::new(
        pool.clone(),
        handle,
    )));

    let channel = Arc::new(
        RedisStreamsChannel::new(&config.redis_url, config.consumer_group.clone())
            .map_err(|e| anyhow!("opening Redis channel: {e}"))?
            .with_consumer(config.consumer_name.clone())
            .with_claim_idle(config.claim_idle),
    );

    let workers = vec![
        spawn_consumer(&channel, &config.routes, WalletCreatedConsumer::new(machine.clone()))?,
        spawn_consumer(&channel, &config.routes, FundsAddedConsumer::new(machine.clone()))?,
        spawn_consumer(&channel, &config.routes, FundsWithdrawnConsumer::new(machine.clone()))?,
        spawn_consumer(&channel, &config.routes, FundsTransferredConsumer::new(machine.clone()))?,
    ];

    let dispatcher =
        OutboxDispatcher::new(outbox, channel.clone(), config.routes.clone(), config.dispatcher)
            .spawn();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");

    // Joining threads blocks; keep it off the runtime workers.
    tokio::task::spawn_blocking(move || {
        let stats = dispatcher.stats();
        dispatcher.shutdown();
        tracing::info!(?stats, "dispatcher stopped");

        channel.close();
        for worker in workers {
            let name = worker.name().to_string();
            let (consumed, errors) = (worker.stats().consumed(), worker.stats().errors());
            worker.shutdown();
            tracing::info!(worker = %name, consumed, errors, "worker stopped");
        }
    })
    .await
    .context("joining background threads")?;

    pool.close().await;
    Ok(())
}

fn spawn_consumer<E>(
    channel: &Arc<RedisStreamsChannel>,
    routes: &DestinationRoutes,
    consumer: EventConsumer<E, PostgresSagaStore>,
) -> anyhow::Result<WorkerHandle>
where
    E: wallethub_events::SagaTrigger + serde::de::DeserializeOwned + 'static,
{
    let destination = routes
        .destination_for(E::EVENT_TYPE)
        .ok_or_else(|| anyhow!("no destination configured for {}", E::EVENT_TYPE))?;
    let name = format!("{}-consumer", destination.trim_end_matches("-topic"));

    tracing::info!(worker = %name, destination, event_type = E::EVENT_TYPE, "starting consumer");
    Ok(ConsumerWorker::spawn(name, channel, destination, consumer))
}
