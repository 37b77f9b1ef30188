//! Transactional outbox: durable intent-to-publish records.
//!
//! The outbox is written in the **same unit of work** as the business
//! mutation it describes and drained by a background dispatcher:
//!
//! ```text
//! use case ──(one transaction)──► wallets + outbox_events(sent = false)
//!                                            │
//!                      OutboxDispatcher ◄────┘ claim_unsent / mark_sent
//!                             │
//!                             ▼
//!                       MessageChannel
//! ```
//!
//! ## Guarantees
//!
//! - **Atomicity**: the record exists iff the business mutation committed.
//! - **At-least-once**: a record with `sent = false` is retried on every
//!   tick until delivery is acknowledged. A crash between delivery and
//!   `mark_sent` redelivers.
//! - **No premature flag**: `sent` flips only after a positive acknowledgment.
//! - **Never dropped**: unsent records are removed only by [`OutboxStore::purge`],
//!   an explicit operator action.
//!
//! ## Multi-instance dispatch
//!
//! Dispatchers claim records under a time-bounded lease (`claimed_by`,
//! `claimed_until`). A record is claimable when it is unsent and its lease is
//! absent or expired, so a crashed dispatcher's records are picked up again
//! once the lease runs out.

pub mod dispatcher;
pub mod in_memory;
pub mod postgres;
pub mod publisher;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dispatcher::{DispatcherHandle, DispatcherStats, OutboxDispatcher, TickReport};
pub use in_memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use publisher::{OutboxPublisher, PublishError};
pub use routes::DestinationRoutes;

/// Store-assigned sequence; storage bookkeeping only.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(i64);

impl OutboxId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for OutboxId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A record about to be inserted (no id, never sent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxRecord {
    /// Discriminator of the serialized envelope variant.
    pub event_type: String,
    /// Serialized envelope.
    pub payload: String,
    /// Denormalized copy of the envelope's correlation id.
    pub correlation_id: Option<String>,
}

/// A persisted outbox record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub event_type: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Unsent and not held by a live lease at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.sent && self.claimed_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Clone, Error)]
pub enum OutboxError {
    #[error("outbox record not found: {0}")]
    NotFound(OutboxId),

    #[error("outbox conflict: {0}")]
    Conflict(String),

    #[error("outbox storage error: {0}")]
    Storage(String),
}

/// Insert side of the outbox, bound to an open unit of work.
///
/// Implementations must write through the caller's transaction; nothing is
/// visible to dispatchers until that transaction commits.
pub trait OutboxWriter {
    fn insert_outbox(&mut self, record: NewOutboxRecord) -> Result<OutboxId, OutboxError>;
}

/// Dispatcher/operator side of the outbox.
///
/// Every mutating call runs in its own short transaction.
pub trait OutboxStore: Send + Sync {
    /// Unsent records, oldest first (best effort), regardless of leases.
    fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Claim up to `limit` claimable records for `owner` for `lease`.
    fn claim_unsent(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Flip `sent` to true and clear the lease. Idempotent.
    fn mark_sent(&self, id: OutboxId) -> Result<(), OutboxError>;

    /// Drop `owner`'s lease on `id` so the next tick retries it.
    fn release(&self, id: OutboxId, owner: &str) -> Result<(), OutboxError>;

    fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxError>;

    fn count_unsent(&self) -> Result<u64, OutboxError>;

    /// Operator action: delete one record whatever its state.
    fn purge(&self, id: OutboxId) -> Result<bool, OutboxError>;

    /// Housekeeping: delete sent records created before `cutoff`.
    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError>;
}

impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        (**self).fetch_unsent(limit)
    }

    fn claim_unsent(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        (**self).claim_unsent(owner, lease, limit)
    }

    fn mark_sent(&self, id: OutboxId) -> Result<(), OutboxError> {
        (**self).mark_sent(id)
    }

    fn release(&self, id: OutboxId, owner: &str) -> Result<(), OutboxError> {
        (**self).release(id, owner)
    }

    fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxError> {
        (**self).get(id)
    }

    fn count_unsent(&self) -> Result<u64, OutboxError> {
        (**self).count_unsent()
    }

    fn purge(&self, id: OutboxId) -> Result<bool, OutboxError> {
        (**self).purge(id)
    }

    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError> {
        (**self).purge_sent_before(cutoff)
    }
}

/// Lease length as a chrono span, capped at one day.
pub(crate) fn lease_span(lease: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(1);
    chrono::Duration::from_std(lease).map_or(cap, |span| span.min(cap))
}
