//! Event consumers: one per envelope variant.
//!
//! A consumer turns a delivered message into a saga event:
//!
//! - correlation id present and payload readable → the variant's saga event
//!   (plus `SagaCompleted` when the variant ends the workflow)
//! - correlation id missing or blank → `SagaFailed` on a synthetic id derived
//!   from the envelope, recording the reason; the mapped event is never tried
//! - payload unreadable → `SagaFailed` on the carried correlation id
//!
//! Consumers never retry. Redelivery is the channel's business, and the
//! state machine turns a repeated event into a `Duplicate` rejection.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

use wallethub_core::CorrelationId;
use wallethub_events::{
    ChannelMessage, EventEnvelope, FundsAdded, FundsTransferred, FundsWithdrawn, RejectionReason,
    SagaEvent, SagaState, SagaTrigger, WalletCreated,
};

use crate::saga::{SagaError, SagaOutcome, SagaStateMachine, SagaStore};

/// Why a consumer forced its saga into `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    MissingCorrelationId,
    UndecodablePayload(String),
}

impl FailureReason {
    pub fn describe(&self) -> String {
        match self {
            FailureReason::MissingCorrelationId => "missing correlation id".to_string(),
            FailureReason::UndecodablePayload(e) => format!("undecodable payload: {e}"),
        }
    }
}

/// What a consumer did with one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumed {
    /// The variant's saga event was applied (accepted or rejected).
    Applied {
        correlation_id: CorrelationId,
        outcome: SagaOutcome,
    },
    /// Validation failed; `SagaFailed` was applied instead.
    ForcedFailure {
        correlation_id: CorrelationId,
        reason: FailureReason,
        outcome: SagaOutcome,
    },
}

impl Consumed {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Consumed::Applied { correlation_id, .. } | Consumed::ForcedFailure { correlation_id, .. } => {
                correlation_id
            }
        }
    }

    pub fn outcome(&self) -> &SagaOutcome {
        match self {
            Consumed::Applied { outcome, .. } | Consumed::ForcedFailure { outcome, .. } => outcome,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Saga(#[from] SagaError),

    /// The message is for another variant; the routing table is wrong.
    #[error("consumer for {expected} received a {found} message")]
    UnexpectedEventType { expected: &'static str, found: String },
}

/// A consumer the worker loop can drive.
pub trait MessageConsumer: Send + Sync {
    /// Event type this consumer accepts.
    fn event_type(&self) -> &'static str;

    fn consume(&self, message: &ChannelMessage) -> Result<Consumed, ConsumerError>;
}

impl<C> MessageConsumer for Arc<C>
where
    C: MessageConsumer + ?Sized,
{
    fn event_type(&self) -> &'static str {
        (**self).event_type()
    }

    fn consume(&self, message: &ChannelMessage) -> Result<Consumed, ConsumerError> {
        (**self).consume(message)
    }
}

/// Consumer for envelopes carrying `E`.
pub struct EventConsumer<E, S> {
    machine: Arc<SagaStateMachine<S>>,
    _event: PhantomData<fn() -> E>,
}

pub type WalletCreatedConsumer<S> = EventConsumer<WalletCreated, S>;
pub type FundsAddedConsumer<S> = EventConsumer<FundsAdded, S>;
pub type FundsWithdrawnConsumer<S> = EventConsumer<FundsWithdrawn, S>;
pub type FundsTransferredConsumer<S> = EventConsumer<FundsTransferred, S>;

impl<E, S> EventConsumer<E, S>
where
    E: SagaTrigger + DeserializeOwned,
    S: SagaStore,
{
    pub fn new(machine: Arc<SagaStateMachine<S>>) -> Self {
        Self {
            machine,
            _event: PhantomData,
        }
    }

    /// Handle an already-decoded envelope.
    pub fn on_envelope(&self, envelope: &EventEnvelope<E>) -> Result<Consumed, ConsumerError> {
        match envelope.correlation_id() {
            Some(correlation_id) => self.advance(correlation_id),
            None => self.force_failure(
                CorrelationId::synthetic(envelope.event_id()),
                FailureReason::MissingCorrelationId,
                &envelope.event_id().to_string(),
            ),
        }
    }

    /// Handle a message straight off the channel.
    ///
    /// The correlation id header is checked before the payload is decoded.
    pub fn on_message(&self, message: &ChannelMessage) -> Result<Consumed, ConsumerError> {
        if message.headers.event_type != E::EVENT_TYPE {
            return Err(ConsumerError::UnexpectedEventType {
                expected: E::EVENT_TYPE,
                found: message.headers.event_type.clone(),
            });
        }

        let header_id = CorrelationId::from_optional(message.headers.correlation_id.as_deref());
        let decoded = serde_json::from_str::<EventEnvelope<E>>(&message.payload);

        match (header_id, decoded) {
            (Some(correlation_id), Ok(_)) => self.advance(correlation_id),
            (None, Ok(envelope)) => self.on_envelope(&envelope),
            (Some(correlation_id), Err(e)) => self.force_failure(
                correlation_id,
                FailureReason::UndecodablePayload(e.to_string()),
                &message.headers.message_id,
            ),
            (None, Err(_)) => self.force_failure(
                CorrelationId::synthetic(format!("message-{}", message.headers.message_id)),
                FailureReason::MissingCorrelationId,
                &message.headers.message_id,
            ),
        }
    }

    fn advance(&self, correlation_id: CorrelationId) -> Result<Consumed, ConsumerError> {
        let mut outcome = self.machine.apply_event(&correlation_id, E::SAGA_EVENT)?;

        if E::COMPLETES_SAGA && awaits_completion(&outcome) {
            outcome = self
                .machine
                .apply_event(&correlation_id, SagaEvent::SagaCompleted)?;
        }

        info!(
            correlation_id = %correlation_id,
            event_type = E::EVENT_TYPE,
            state = %outcome.state(),
            accepted = outcome.is_transitioned(),
            "envelope consumed"
        );
        Ok(Consumed::Applied {
            correlation_id,
            outcome,
        })
    }

    fn force_failure(
        &self,
        correlation_id: CorrelationId,
        reason: FailureReason,
        source: &str,
    ) -> Result<Consumed, ConsumerError> {
        warn!(
            correlation_id = %correlation_id,
            event_type = E::EVENT_TYPE,
            source,
            reason = %reason.describe(),
            "invalid envelope; failing saga"
        );

        let mut extended = Map::new();
        extended.insert("failure_reason".into(), JsonValue::from(reason.describe()));
        extended.insert("failed_event_type".into(), JsonValue::from(E::EVENT_TYPE));
        extended.insert("failed_source".into(), JsonValue::from(source));

        let outcome = self
            .machine
            .apply_event_with(&correlation_id, SagaEvent::SagaFailed, Some(extended))?;
        Ok(Consumed::ForcedFailure {
            correlation_id,
            reason,
            outcome,
        })
    }
}

/// The workflow's last step is recorded but `SagaCompleted` is not.
///
/// A duplicate still counts: the first delivery may have persisted the step
/// and then failed to persist the completion.
fn awaits_completion(outcome: &SagaOutcome) -> bool {
    match outcome {
        SagaOutcome::Transitioned(_) => true,
        SagaOutcome::Rejected(rejection) => {
            rejection.reason == RejectionReason::Duplicate
                && rejection.state == SagaState::FundsTransferred
        }
    }
}

impl<E, S> MessageConsumer for EventConsumer<E, S>
where
    E: SagaTrigger + DeserializeOwned,
    S: SagaStore,
{
    fn event_type(&self) -> &'static str {
        E::EVENT_TYPE
    }

    fn consume(&self, message: &ChannelMessage) -> Result<Consumed, ConsumerError> {
        self.on_message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::{InMemorySagaStore, SagaStoreError};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicBool, Ordering};
    use wallethub_core::{Amount, EventId, UserId, WalletId};
    use wallethub_events::{MessageHeaders, SagaInstance};

    type Machine = Arc<SagaStateMachine<Arc<InMemorySagaStore>>>;

    fn machine() -> Machine {
        Arc::new(SagaStateMachine::new(InMemorySagaStore::arc()))
    }

    fn id(raw: &str) -> CorrelationId {
        CorrelationId::parse(raw).unwrap()
    }

    fn message<E: serde::Serialize + wallethub_events::Event>(
        envelope: &EventEnvelope<E>,
        header: Option<&str>,
    ) -> ChannelMessage {
        ChannelMessage::new(
            MessageHeaders {
                message_id: "42".into(),
                event_type: E::EVENT_TYPE.into(),
                correlation_id: header.map(str::to_string),
            },
            serde_json::to_string(envelope).unwrap(),
        )
    }

    fn created(correlation: Option<String>) -> EventEnvelope<WalletCreated> {
        EventEnvelope::from_parts(
            EventId::new(),
            chrono::Utc::now(),
            correlation,
            WalletCreated {
                wallet_id: WalletId::new(),
                user_id: UserId::new(),
            },
        )
    }

    #[test]
    fn valid_envelope_advances_the_saga() {
        let machine = machine();
        let consumer = WalletCreatedConsumer::new(machine.clone());

        let consumed = consumer.on_message(&message(&created(Some("corr-1".into())), Some("corr-1"))).unwrap();

        assert!(matches!(consumed, Consumed::Applied { .. }));
        assert_eq!(machine.state(&id("corr-1")).unwrap(), Some(SagaState::WalletCreated));
    }

    #[test]
    fn missing_correlation_id_fails_the_saga_without_trying_the_event() {
        let machine = machine();
        let consumer = WalletCreatedConsumer::new(machine.clone());
        let envelope = created(None);

        let consumed = consumer.on_message(&message(&envelope, None)).unwrap();

        let Consumed::ForcedFailure { correlation_id, reason, outcome } = consumed else {
            panic!("expected forced failure");
        };
        assert_eq!(reason, FailureReason::MissingCorrelationId);
        assert_eq!(correlation_id, CorrelationId::synthetic(envelope.event_id()));
        assert_eq!(outcome.state(), SagaState::Failed);

        let instance = machine.instance(&correlation_id).unwrap().unwrap();
        assert_eq!(instance.version(), 1);
        assert_eq!(instance.extended_state()["failure_reason"], "missing correlation id");
    }

    #[test]
    fn blank_correlation_id_counts_as_missing() {
        let machine = machine();
        let consumer = WalletCreatedConsumer::new(machine.clone());
        let envelope = created(Some("   ".into()));

        let consumed = consumer.on_envelope(&envelope).unwrap();
        assert!(matches!(
            consumed,
            Consumed::ForcedFailure { reason: FailureReason::MissingCorrelationId, .. }
        ));
    }

    #[test]
    fn redelivered_orphan_maps_to_the_same_failed_instance() {
        let machine = machine();
        let consumer = WalletCreatedConsumer::new(machine.clone());
        let envelope = created(None);

        consumer.on_envelope(&envelope).unwrap();
        let again = consumer.on_envelope(&envelope).unwrap();

        assert!(!again.outcome().is_transitioned());
        assert_eq!(machine.store().len(), 1);
    }

    #[test]
    fn undecodable_payload_fails_the_carried_saga() {
        let machine = machine();
        let consumer = FundsAddedConsumer::new(machine.clone());
        let corr = id("corr-7");
        machine.apply_event(&corr, SagaEvent::WalletCreated).unwrap();

        let garbage = ChannelMessage::new(
            MessageHeaders {
                message_id: "7".into(),
                event_type: "FundsAdded".into(),
                correlation_id: Some("corr-7".into()),
            },
            "{not json",
        );
        let consumed = consumer.on_message(&garbage).unwrap();

        assert!(matches!(consumed, Consumed::ForcedFailure { reason: FailureReason::UndecodablePayload(_), .. }));
        assert_eq!(machine.state(&corr).unwrap(), Some(SagaState::Failed));
    }

    #[test]
    fn funds_transferred_completes_the_workflow() {
        let machine = machine();
        let corr = id("corr-9");
        for event in [SagaEvent::WalletCreated, SagaEvent::FundsAdded, SagaEvent::FundsWithdrawn] {
            machine.apply_event(&corr, event).unwrap();
        }

        let consumer = FundsTransferredConsumer::new(machine.clone());
        let amount = Amount::new(Decimal::TEN).unwrap();
        let envelope = EventEnvelope::new(
            Some(corr.clone()),
            FundsTransferred {
                from_wallet_id: WalletId::new(),
                to_wallet_id: WalletId::new(),
                amount,
            },
        );
        consumer.on_message(&message(&envelope, Some("corr-9"))).unwrap();

        assert_eq!(machine.state(&corr).unwrap(), Some(SagaState::Completed));
    }

    /// Fails the first save that would move an instance into `Completed`.
    struct CompletionFailsOnce {
        inner: InMemorySagaStore,
        tripped: AtomicBool,
    }

    impl SagaStore for CompletionFailsOnce {
        fn load(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>, SagaStoreError> {
            self.inner.load(correlation_id)
        }

        fn save(&self, instance: &SagaInstance, expected_version: u64) -> Result<(), SagaStoreError> {
            if instance.current_state() == SagaState::Completed && !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(SagaStoreError::Storage("connection reset".into()));
            }
            self.inner.save(instance, expected_version)
        }

        fn list_by_state(&self, state: SagaState, limit: usize) -> Result<Vec<SagaInstance>, SagaStoreError> {
            self.inner.list_by_state(state, limit)
        }
    }

    #[test]
    fn redelivered_transfer_completes_a_saga_whose_completion_was_lost() {
        let machine = Arc::new(SagaStateMachine::new(CompletionFailsOnce {
            inner: InMemorySagaStore::new(),
            tripped: AtomicBool::new(false),
        }));
        let corr = id("corr-10");
        for event in [SagaEvent::WalletCreated, SagaEvent::FundsAdded, SagaEvent::FundsWithdrawn] {
            machine.apply_event(&corr, event).unwrap();
        }

        let consumer = FundsTransferredConsumer::new(machine.clone());
        let envelope = EventEnvelope::new(
            Some(corr.clone()),
            FundsTransferred {
                from_wallet_id: WalletId::new(),
                to_wallet_id: WalletId::new(),
                amount: Amount::new(Decimal::TEN).unwrap(),
            },
        );
        let delivery = message(&envelope, Some("corr-10"));

        assert!(matches!(consumer.on_message(&delivery), Err(ConsumerError::Saga(_))));
        assert_eq!(machine.state(&corr).unwrap(), Some(SagaState::FundsTransferred));

        let consumed = consumer.on_message(&delivery).unwrap();

        assert!(consumed.outcome().is_transitioned());
        assert_eq!(machine.state(&corr).unwrap(), Some(SagaState::Completed));

        // Once completed, further redeliveries are plain terminal rejections.
        let again = consumer.on_message(&delivery).unwrap();
        assert!(matches!(
            again.outcome(),
            SagaOutcome::Rejected(r) if r.reason == RejectionReason::Terminal
        ));
    }

    #[test]
    fn duplicate_of_an_earlier_step_does_not_complete() {
        let machine = machine();
        let corr = id("corr-11");
        machine.apply_event(&corr, SagaEvent::WalletCreated).unwrap();
        machine.apply_event(&corr, SagaEvent::FundsAdded).unwrap();

        let consumer = FundsAddedConsumer::new(machine.clone());
        let envelope = EventEnvelope::new(
            Some(corr.clone()),
            FundsAdded {
                wallet_id: WalletId::new(),
                amount: Amount::new(Decimal::ONE).unwrap(),
            },
        );
        consumer.on_message(&message(&envelope, Some("corr-11"))).unwrap();

        assert_eq!(machine.state(&corr).unwrap(), Some(SagaState::FundsAdded));
    }

    #[test]
    fn out_of_order_envelope_is_rejected_not_failed() {
        let machine = machine();
        let consumer = FundsAddedConsumer::new(machine.clone());
        let envelope = EventEnvelope::new(
            Some(id("corr-2")),
            FundsAdded {
                wallet_id: WalletId::new(),
                amount: Amount::new(Decimal::ONE).unwrap(),
            },
        );

        let consumed = consumer.on_message(&message(&envelope, Some("corr-2"))).unwrap();

        assert!(matches!(consumed.outcome(), SagaOutcome::Rejected(_)));
        assert_eq!(machine.state(&id("corr-2")).unwrap(), None);
    }

    #[test]
    fn misrouted_message_is_an_error() {
        let consumer = FundsAddedConsumer::new(machine());
        let err = consumer
            .on_message(&message(&created(Some("c".into())), Some("c")))
            .unwrap_err();
        assert!(matches!(err, ConsumerError::UnexpectedEventType { expected: "FundsAdded", .. }));
    }
}
