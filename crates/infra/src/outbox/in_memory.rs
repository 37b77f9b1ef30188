//! In-memory outbox store for tests/dev.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{NewOutboxRecord, OutboxError, OutboxId, OutboxRecord, OutboxStore, lease_span};

#[derive(Debug, Default)]
struct Table {
    next_id: i64,
    records: BTreeMap<OutboxId, OutboxRecord>,
}

/// In-memory outbox table.
///
/// Records are kept in id order, which is also insertion order. Inserts
/// normally arrive through [`InMemoryUnitOfWork`](crate::unit_of_work::InMemoryUnitOfWork)
/// at commit time; [`insert`](Self::insert) is the direct path for tests.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    table: RwLock<Table>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert one committed record.
    pub fn insert(&self, record: NewOutboxRecord) -> Result<OutboxId, OutboxError> {
        Ok(self.insert_all(vec![record])?.remove(0))
    }

    /// Insert several records under one lock (one commit).
    pub fn insert_all(&self, records: Vec<NewOutboxRecord>) -> Result<Vec<OutboxId>, OutboxError> {
        let mut table = self.write()?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            table.next_id += 1;
            let id = OutboxId::new(table.next_id);
            table.records.insert(
                id,
                OutboxRecord {
                    id,
                    event_type: record.event_type,
                    payload: record.payload,
                    correlation_id: record.correlation_id,
                    created_at: now,
                    sent: false,
                    sent_at: None,
                    claimed_by: None,
                    claimed_until: None,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    /// Every record, sent or not, in id order.
    pub fn all(&self) -> Result<Vec<OutboxRecord>, OutboxError> {
        Ok(self.read()?.records.values().cloned().collect())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Table>, OutboxError> {
        self.table
            .read()
            .map_err(|_| OutboxError::Storage("outbox table lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Table>, OutboxError> {
        self.table
            .write()
            .map_err(|_| OutboxError::Storage("outbox table lock poisoned".into()))
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let table = self.read()?;
        Ok(table
            .records
            .values()
            .filter(|r| !r.sent)
            .take(limit)
            .cloned()
            .collect())
    }

    fn claim_unsent(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut table = self.write()?;
        let now = Utc::now();
        let until = now + lease_span(lease);

        let mut claimed = Vec::new();
        for record in table.records.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if record.is_claimable(now) {
                record.claimed_by = Some(owner.to_string());
                record.claimed_until = Some(until);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    fn mark_sent(&self, id: OutboxId) -> Result<(), OutboxError> {
        let mut table = self.write()?;
        let record = table.records.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        if !record.sent {
            record.sent = true;
            record.sent_at = Some(Utc::now());
        }
        record.claimed_by = None;
        record.claimed_until = None;
        Ok(())
    }

    fn release(&self, id: OutboxId, owner: &str) -> Result<(), OutboxError> {
        let mut table = self.write()?;
        if let Some(record) = table.records.get_mut(&id) {
            if record.claimed_by.as_deref() == Some(owner) {
                record.claimed_by = None;
                record.claimed_until = None;
            }
        }
        Ok(())
    }

    fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxError> {
        Ok(self.read()?.records.get(&id).cloned())
    }

    fn count_unsent(&self) -> Result<u64, OutboxError> {
        Ok(self.read()?.records.values().filter(|r| !r.sent).count() as u64)
    }

    fn purge(&self, id: OutboxId) -> Result<bool, OutboxError> {
        Ok(self.write()?.records.remove(&id).is_some())
    }

    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut table = self.write()?;
        let before = table.records.len();
        table.records.retain(|_, r| !(r.sent && r.created_at < cutoff));
        Ok((before - table.records.len()) as u64)
    }
}
