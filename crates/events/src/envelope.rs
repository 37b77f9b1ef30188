use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wallethub_core::{CorrelationId, EventId};

use crate::Event;

/// Last `occurred_at` handed out in this process, in microseconds.
static LAST_OCCURRED_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Wall clock reading clamped so it never goes backwards within the process.
fn next_occurred_at() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_OCCURRED_MICROS.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last);
        match LAST_OCCURRED_MICROS.compare_exchange_weak(
            last,
            candidate,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return DateTime::from_timestamp_micros(candidate).unwrap_or_else(Utc::now),
            Err(actual) => last = actual,
        }
    }
}

/// Immutable record describing "something happened".
///
/// This is the unit the outbox serializes and the channel carries.
///
/// Notes:
/// - `event_id` and `occurred_at` are generated at construction.
/// - `occurred_at` is non-decreasing across envelopes built in one process.
/// - `correlation_id` is kept as the raw wire value: envelopes decoded from
///   malformed input may carry none (or a blank one), and consumers must be
///   able to observe that instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    event_id: EventId,
    occurred_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,

    payload: P,
}

impl<P> EventEnvelope<P> {
    pub fn new(correlation_id: Option<CorrelationId>, payload: P) -> Self {
        Self {
            event_id: EventId::new(),
            occurred_at: next_occurred_at(),
            correlation_id: correlation_id.map(String::from),
            payload,
        }
    }

    /// Rebuild an envelope from already-known parts (decoding, fixtures).
    pub fn from_parts(
        event_id: EventId,
        occurred_at: DateTime<Utc>,
        correlation_id: Option<String>,
        payload: P,
    ) -> Self {
        Self {
            event_id,
            occurred_at,
            correlation_id,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Correlation id exactly as carried (may be absent or blank).
    pub fn raw_correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Validated correlation id; `None` when absent or blank.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        CorrelationId::from_optional(self.correlation_id.as_deref())
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

impl<P: Event> EventEnvelope<P> {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}
