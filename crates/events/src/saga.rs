//! Saga state machine vocabulary (mechanics only, no IO).
//!
//! - One saga instance per correlation id
//! - A closed set of states and events
//! - A static, data-only transition table keyed by (state, event)
//! - Every non-terminal state carries its own explicit `SagaFailed` edge
//!
//! Infra is responsible for loading instances, serializing writers per
//! correlation id and persisting the result of each transition.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use wallethub_core::{CorrelationId, DomainError};

use crate::Event;

/// Saga states. `Completed` and `Failed` are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaState {
    Initial,
    WalletCreated,
    FundsAdded,
    FundsWithdrawn,
    FundsTransferred,
    Completed,
    Failed,
}

impl SagaState {
    pub const ALL: [SagaState; 7] = [
        SagaState::Initial,
        SagaState::WalletCreated,
        SagaState::FundsAdded,
        SagaState::FundsWithdrawn,
        SagaState::FundsTransferred,
        SagaState::Completed,
        SagaState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SagaState::Initial => "Initial",
            SagaState::WalletCreated => "WalletCreated",
            SagaState::FundsAdded => "FundsAdded",
            SagaState::FundsWithdrawn => "FundsWithdrawn",
            SagaState::FundsTransferred => "FundsTransferred",
            SagaState::Completed => "Completed",
            SagaState::Failed => "Failed",
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SagaState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown saga state '{s}'")))
    }
}

/// Saga events: the vocabulary the transition table is defined over.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaEvent {
    WalletCreated,
    FundsAdded,
    FundsWithdrawn,
    FundsTransferred,
    SagaCompleted,
    SagaFailed,
}

impl SagaEvent {
    pub const ALL: [SagaEvent; 6] = [
        SagaEvent::WalletCreated,
        SagaEvent::FundsAdded,
        SagaEvent::FundsWithdrawn,
        SagaEvent::FundsTransferred,
        SagaEvent::SagaCompleted,
        SagaEvent::SagaFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SagaEvent::WalletCreated => "WalletCreated",
            SagaEvent::FundsAdded => "FundsAdded",
            SagaEvent::FundsWithdrawn => "FundsWithdrawn",
            SagaEvent::FundsTransferred => "FundsTransferred",
            SagaEvent::SagaCompleted => "SagaCompleted",
            SagaEvent::SagaFailed => "SagaFailed",
        }
    }
}

impl fmt::Display for SagaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table: `(from, event, to)`.
///
/// Happy path first, then one explicit failure edge per non-terminal state.
/// Nothing leaves `Completed` or `Failed`.
pub const TRANSITIONS: &[(SagaState, SagaEvent, SagaState)] = &[
    (SagaState::Initial, SagaEvent::WalletCreated, SagaState::WalletCreated),
    (SagaState::WalletCreated, SagaEvent::FundsAdded, SagaState::FundsAdded),
    (SagaState::FundsAdded, SagaEvent::FundsWithdrawn, SagaState::FundsWithdrawn),
    (SagaState::FundsWithdrawn, SagaEvent::FundsTransferred, SagaState::FundsTransferred),
    (SagaState::FundsTransferred, SagaEvent::SagaCompleted, SagaState::Completed),
    (SagaState::Initial, SagaEvent::SagaFailed, SagaState::Failed),
    (SagaState::WalletCreated, SagaEvent::SagaFailed, SagaState::Failed),
    (SagaState::FundsAdded, SagaEvent::SagaFailed, SagaState::Failed),
    (SagaState::FundsWithdrawn, SagaEvent::SagaFailed, SagaState::Failed),
    (SagaState::FundsTransferred, SagaEvent::SagaFailed, SagaState::Failed),
];

/// Look up `(from, event)` in [`TRANSITIONS`].
pub fn next_state(from: SagaState, event: SagaEvent) -> Option<SagaState> {
    TRANSITIONS
        .iter()
        .find(|(source, trigger, _)| *source == from && *trigger == event)
        .map(|(_, _, target)| *target)
}

/// An envelope payload that advances the saga when consumed.
pub trait SagaTrigger: Event {
    const SAGA_EVENT: SagaEvent;

    /// Whether a successful transition on this payload ends the workflow,
    /// in which case the consumer follows it with `SagaCompleted`.
    const COMPLETES_SAGA: bool = false;
}

/// Why an event had no table entry for the instance's current state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// The saga already finished; nothing leaves a terminal state.
    Terminal,
    /// The event leads to the state the saga is already in (redelivery).
    Duplicate,
    /// The event does not follow from the current state.
    OutOfOrder,
}

/// A rejected `(state, event)` pair. The instance is left untouched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub state: SagaState,
    pub event: SagaEvent,
    pub reason: RejectionReason,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no transition for {} in state {} ({:?})",
            self.event, self.state, self.reason
        )
    }
}

/// An accepted transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SagaState,
    pub event: SagaEvent,
    pub to: SagaState,
}

/// One tracked workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    correlation_id: CorrelationId,
    current_state: SagaState,
    /// Auxiliary data attached during transitions; opaque to the machine.
    extended_state: Map<String, JsonValue>,
    /// Number of transitions applied; used for optimistic concurrency.
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SagaInstance {
    /// Fresh instance in `Initial`.
    pub fn new(correlation_id: CorrelationId) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            current_state: SagaState::Initial,
            extended_state: Map::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rehydrate from storage.
    pub fn restore(
        correlation_id: CorrelationId,
        current_state: SagaState,
        extended_state: Map<String, JsonValue>,
        version: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id,
            current_state,
            extended_state,
            version,
            created_at,
            updated_at,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn current_state(&self) -> SagaState {
        self.current_state
    }

    pub fn extended_state(&self) -> &Map<String, JsonValue> {
        &self.extended_state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Decide the target state without mutating anything.
    pub fn decide(&self, event: SagaEvent) -> Result<Transition, Rejection> {
        let from = self.current_state;
        match next_state(from, event) {
            Some(to) => Ok(Transition { from, event, to }),
            None => Err(Rejection {
                state: from,
                event,
                reason: classify(from, event),
            }),
        }
    }

    /// Apply `event`, merging `extended` into the auxiliary data on success.
    ///
    /// On rejection nothing changes, including the extended state.
    pub fn apply(
        &mut self,
        event: SagaEvent,
        extended: Option<Map<String, JsonValue>>,
    ) -> Result<Transition, Rejection> {
        let transition = self.decide(event)?;
        self.current_state = transition.to;
        if let Some(extra) = extended {
            self.extended_state.extend(extra);
        }
        self.version += 1;
        self.updated_at = Utc::now();
        Ok(transition)
    }
}

fn classify(state: SagaState, event: SagaEvent) -> RejectionReason {
    if state.is_terminal() {
        return RejectionReason::Terminal;
    }
    let leads_here = TRANSITIONS
        .iter()
        .any(|(_, trigger, target)| *trigger == event && *target == state);
    if leads_here {
        RejectionReason::Duplicate
    } else {
        RejectionReason::OutOfOrder
    }
}
