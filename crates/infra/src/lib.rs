//! Infrastructure layer: outbox, dispatcher, saga store, consumers, Postgres, Redis.

pub mod channel;
pub mod config;
pub mod consumers;
pub mod outbox;
pub mod pg;
pub mod saga;
pub mod unit_of_work;
pub mod wallet_service;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, DispatcherConfig, RelayConfig};
pub use consumers::{Consumed, ConsumerError, EventConsumer, FailureReason, MessageConsumer};
pub use outbox::{
    DestinationRoutes, DispatcherHandle, OutboxDispatcher, OutboxError, OutboxId, OutboxPublisher,
    OutboxRecord, OutboxStore, PublishError,
};
pub use saga::{SagaError, SagaOutcome, SagaStateMachine, SagaStore};
pub use wallet_service::{Receipt, ServiceError, WalletService};
