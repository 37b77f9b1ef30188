//! Saga state machine service.
//!
//! `apply_event(correlation_id, event)`:
//!
//! 1. Serialize on the correlation id (one writer per id in this process)
//! 2. Load the instance, or start a fresh one in `Initial`
//! 3. Look up `(current_state, event)` in the static table
//! 4. No entry: report a [`SagaOutcome::Rejected`], persist nothing
//! 5. Entry: persist the new state (version-checked), then report success
//!
//! Across processes the version check is the serialization point: a lost
//! race reloads and decides again, so a redelivered event that another
//! instance already applied turns into a `Duplicate` rejection.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

use wallethub_core::CorrelationId;
use wallethub_events::{Rejection, SagaEvent, SagaInstance, SagaState, Transition};

use super::{SagaStore, SagaStoreError};

/// Attempts per call when the version check keeps losing.
const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Result of a well-formed `apply_event` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    /// The transition was persisted.
    Transitioned(Transition),
    /// No table entry for the current state; nothing changed.
    Rejected(Rejection),
}

impl SagaOutcome {
    /// State of the instance after the call.
    pub fn state(&self) -> SagaState {
        match self {
            SagaOutcome::Transitioned(t) => t.to,
            SagaOutcome::Rejected(r) => r.state,
        }
    }

    pub fn is_transitioned(&self) -> bool {
        matches!(self, SagaOutcome::Transitioned(_))
    }
}

#[derive(Debug, Error)]
pub enum SagaError {
    #[error(transparent)]
    Store(#[from] SagaStoreError),

    #[error("saga {correlation_id} kept changing underneath us ({attempts} attempts)")]
    Contended {
        correlation_id: CorrelationId,
        attempts: usize,
    },
}

/// Applies saga events against a [`SagaStore`].
pub struct SagaStateMachine<S> {
    store: S,
    locks: DashMap<CorrelationId, Arc<Mutex<()>>>,
    max_attempts: usize,
}

impl<S: SagaStore> SagaStateMachine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn apply_event(
        &self,
        correlation_id: &CorrelationId,
        event: SagaEvent,
    ) -> Result<SagaOutcome, SagaError> {
        self.apply_event_with(correlation_id, event, None)
    }

    /// Like [`apply_event`](Self::apply_event), merging `extended` into the
    /// instance's auxiliary data when the transition is accepted.
    pub fn apply_event_with(
        &self,
        correlation_id: &CorrelationId,
        event: SagaEvent,
        extended: Option<Map<String, JsonValue>>,
    ) -> Result<SagaOutcome, SagaError> {
        let lock = self
            .locks
            .entry(correlation_id.clone())
            .or_default()
            .clone();

        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.apply_locked(correlation_id, event, extended)
        };

        drop(lock);
        self.locks
            .remove_if(correlation_id, |_, l| Arc::strong_count(l) == 1);
        outcome
    }

    fn apply_locked(
        &self,
        correlation_id: &CorrelationId,
        event: SagaEvent,
        extended: Option<Map<String, JsonValue>>,
    ) -> Result<SagaOutcome, SagaError> {
        for attempt in 1..=self.max_attempts {
            let mut instance = self
                .store
                .load(correlation_id)?
                .unwrap_or_else(|| SagaInstance::new(correlation_id.clone()));
            let expected = instance.version();

            let transition = match instance.apply(event, extended.clone()) {
                Ok(t) => t,
                Err(rejection) => {
                    warn!(
                        correlation_id = %correlation_id,
                        state = %rejection.state,
                        event = %rejection.event,
                        reason = ?rejection.reason,
                        "saga transition rejected"
                    );
                    return Ok(SagaOutcome::Rejected(rejection));
                }
            };

            match self.store.save(&instance, expected) {
                Ok(()) => {
                    info!(
                        correlation_id = %correlation_id,
                        from = %transition.from,
                        to = %transition.to,
                        event = %transition.event,
                        "saga transitioned"
                    );
                    return Ok(SagaOutcome::Transitioned(transition));
                }
                Err(SagaStoreError::Conflict { .. }) => {
                    debug!(correlation_id = %correlation_id, attempt, "saga version conflict; reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SagaError::Contended {
            correlation_id: correlation_id.clone(),
            attempts: self.max_attempts,
        })
    }

    pub fn state(&self, correlation_id: &CorrelationId) -> Result<Option<SagaState>, SagaError> {
        Ok(self.instance(correlation_id)?.map(|i| i.current_state()))
    }

    pub fn instance(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>, SagaError> {
        Ok(self.store.load(correlation_id)?)
    }

    pub fn list_by_state(&self, state: SagaState, limit: usize) -> Result<Vec<SagaInstance>, SagaError> {
        Ok(self.store.list_by_state(state, limit)?)
    }
}
