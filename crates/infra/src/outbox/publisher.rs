//! Outbox publisher: records an envelope inside the caller's unit of work.
//!
//! No network IO happens here. Delivery is the dispatcher's job; the
//! publisher only turns an envelope into an [`NewOutboxRecord`] and inserts
//! it through the writer the caller hands in.

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use wallethub_core::CorrelationId;
use wallethub_events::{Event, EventEnvelope};

use super::{DestinationRoutes, NewOutboxRecord, OutboxError, OutboxId, OutboxWriter};

#[derive(Debug, Error)]
pub enum PublishError {
    /// The envelope could not be serialized. Fatal to the enclosing unit of work.
    #[error("failed to serialize {event_type} envelope: {source}")]
    Serialization {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Strict routing is on and no destination exists for the event type.
    #[error("no destination configured for event type {0}")]
    Unroutable(&'static str),

    #[error(transparent)]
    Store(#[from] OutboxError),
}

/// Serializes envelopes into outbox records.
///
/// With [`with_routes`](Self::with_routes) the publisher refuses event types
/// that have no destination, so the business operation fails instead of
/// recording an intent the dispatcher can never deliver.
#[derive(Debug, Clone, Default)]
pub struct OutboxPublisher {
    routes: Option<DestinationRoutes>,
}

impl OutboxPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routes(mut self, routes: DestinationRoutes) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Record `envelope` through `writer`.
    ///
    /// The caller must already have applied its business mutation in the same
    /// unit of work and must commit (or drop) it afterwards. Any error here
    /// must abort that unit of work.
    pub fn publish<W, E>(
        &self,
        writer: &mut W,
        envelope: &EventEnvelope<E>,
    ) -> Result<OutboxId, PublishError>
    where
        W: OutboxWriter + ?Sized,
        E: Event + Serialize,
    {
        let event_type = E::EVENT_TYPE;

        if let Some(routes) = &self.routes {
            if !routes.contains(event_type) {
                return Err(PublishError::Unroutable(event_type));
            }
        }

        let payload = serde_json::to_string(envelope)
            .map_err(|source| PublishError::Serialization { event_type, source })?;

        let correlation_id = CorrelationId::from_optional(envelope.raw_correlation_id())
            .map(String::from);

        let id = writer.insert_outbox(NewOutboxRecord {
            event_type: event_type.to_string(),
            payload,
            correlation_id,
        })?;

        debug!(
            outbox_id = %id,
            event_type,
            event_id = %envelope.event_id(),
            correlation_id = envelope.raw_correlation_id().unwrap_or(""),
            "outbox record staged"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serializer;
    use wallethub_core::{UserId, WalletId};
    use wallethub_events::WalletCreated;

    #[derive(Default)]
    struct RecordingWriter {
        records: Vec<NewOutboxRecord>,
    }

    impl OutboxWriter for RecordingWriter {
        fn insert_outbox(&mut self, record: NewOutboxRecord) -> Result<OutboxId, OutboxError> {
            self.records.push(record);
            Ok(OutboxId::new(self.records.len() as i64))
        }
    }

    #[derive(Debug, Clone)]
    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refusing to serialize"))
        }
    }

    impl Event for Unserializable {
        const EVENT_TYPE: &'static str = "Unserializable";
    }

    fn created(correlation: Option<&str>) -> EventEnvelope<WalletCreated> {
        EventEnvelope::new(
            correlation.map(|c| CorrelationId::parse(c).unwrap()),
            WalletCreated {
                wallet_id: WalletId::new(),
                user_id: UserId::new(),
            },
        )
    }

    #[test]
    fn records_type_payload_and_correlation() {
        let mut writer = RecordingWriter::default();
        let envelope = created(Some("corr-1"));

        OutboxPublisher::new().publish(&mut writer, &envelope).unwrap();

        let record = &writer.records[0];
        assert_eq!(record.event_type, "WalletCreated");
        assert_eq!(record.correlation_id.as_deref(), Some("corr-1"));
        let decoded: EventEnvelope<WalletCreated> = serde_json::from_str(&record.payload).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn missing_correlation_is_recorded_as_null() {
        let mut writer = RecordingWriter::default();
        OutboxPublisher::new().publish(&mut writer, &created(None)).unwrap();
        assert_eq!(writer.records[0].correlation_id, None);
    }

    #[test]
    fn serialization_failure_writes_nothing() {
        let mut writer = RecordingWriter::default();
        let envelope = EventEnvelope::new(None, Unserializable);

        let err = OutboxPublisher::new().publish(&mut writer, &envelope).unwrap_err();
        assert!(matches!(err, PublishError::Serialization { event_type: "Unserializable", .. }));
        assert!(writer.records.is_empty());
    }

    #[test]
    fn strict_routing_refuses_unknown_types() {
        let mut writer = RecordingWriter::default();
        let publisher = OutboxPublisher::new().with_routes(DestinationRoutes::empty());

        let err = publisher.publish(&mut writer, &created(Some("c"))).unwrap_err();
        assert!(matches!(err, PublishError::Unroutable("WalletCreated")));
        assert!(writer.records.is_empty());
    }
}
