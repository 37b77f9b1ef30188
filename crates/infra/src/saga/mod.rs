//! Saga infrastructure: instance persistence and the state machine service.
//!
//! The transition table and instance mechanics live in `wallethub_events::saga`.
//! This module adds:
//!
//! - [`SagaStore`]: `correlation_id → instance` persistence with optimistic
//!   versioning (in-memory and Postgres)
//! - [`SagaStateMachine`]: load, decide, persist, with one writer per
//!   correlation id

pub mod in_memory;
pub mod machine;
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

use wallethub_core::CorrelationId;
use wallethub_events::{SagaInstance, SagaState};

pub use in_memory::InMemorySagaStore;
pub use machine::{SagaError, SagaOutcome, SagaStateMachine};
pub use postgres::PostgresSagaStore;

#[derive(Debug, Clone, Error)]
pub enum SagaStoreError {
    /// The stored version no longer matches the one the write was based on.
    #[error("saga {correlation_id} was modified concurrently (expected version {expected})")]
    Conflict {
        correlation_id: CorrelationId,
        expected: u64,
    },

    #[error("saga storage error: {0}")]
    Storage(String),

    /// A stored instance could not be decoded.
    #[error("corrupt saga row: {0}")]
    Corrupt(String),
}

/// Durable `correlation_id → saga instance` map.
pub trait SagaStore: Send + Sync {
    fn load(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>, SagaStoreError>;

    /// Persist `instance` if the stored version still equals `expected_version`.
    ///
    /// `expected_version == 0` means "must not exist yet".
    fn save(&self, instance: &SagaInstance, expected_version: u64) -> Result<(), SagaStoreError>;

    /// Instances currently in `state`, least recently updated first.
    fn list_by_state(&self, state: SagaState, limit: usize) -> Result<Vec<SagaInstance>, SagaStoreError>;
}

impl<S> SagaStore for Arc<S>
where
    S: SagaStore + ?Sized,
{
    fn load(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>, SagaStoreError> {
        (**self).load(correlation_id)
    }

    fn save(&self, instance: &SagaInstance, expected_version: u64) -> Result<(), SagaStoreError> {
        (**self).save(instance, expected_version)
    }

    fn list_by_state(&self, state: SagaState, limit: usize) -> Result<Vec<SagaInstance>, SagaStoreError> {
        (**self).list_by_state(state, limit)
    }
}
