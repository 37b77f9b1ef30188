//! Postgres-backed outbox store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE ... RETURNING`,
//! so concurrent dispatchers never receive the same record while a lease is
//! live, and a dispatcher never waits on another one's row locks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use super::{OutboxError, OutboxId, OutboxRecord, OutboxStore};
use crate::pg::{describe, is_unique_violation};

const RECORD_COLUMNS: &str = "id, event_type, payload, correlation_id, created_at, sent, sent_at, claimed_by, claimed_until";

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_unsent_async(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_events WHERE sent = FALSE ORDER BY created_at, id LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_unsent", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self, lease), fields(lease_ms = lease.as_millis() as u64, claimed = tracing::field::Empty), err)]
    pub async fn claim_unsent_async(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE outbox_events AS o
            SET claimed_by = $1,
                claimed_until = now() + make_interval(secs => $2)
            WHERE o.id IN (
                SELECT id
                FROM outbox_events
                WHERE sent = FALSE
                  AND (claimed_until IS NULL OR claimed_until <= now())
                ORDER BY created_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(owner)
        .bind(lease.as_secs_f64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_unsent", e))?;

        let mut records = decode_rows(rows)?;
        records.sort_by_key(|r| r.id);
        Span::current().record("claimed", records.len());
        Ok(records)
    }

    #[instrument(skip(self, id), fields(outbox_id = %id), err)]
    pub async fn mark_sent_async(&self, id: OutboxId) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET sent = TRUE,
                sent_at = COALESCE(sent_at, now()),
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.value())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_sent", e))?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, id), fields(outbox_id = %id), err)]
    pub async fn release_async(&self, id: OutboxId, owner: &str) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET claimed_by = NULL, claimed_until = NULL
            WHERE id = $1 AND claimed_by = $2 AND sent = FALSE
            "#,
        )
        .bind(id.value())
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        Ok(())
    }

    pub async fn get_async(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    pub async fn count_unsent_async(&self) -> Result<u64, OutboxError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM outbox_events WHERE sent = FALSE")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_unsent", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| OutboxError::Storage(format!("failed to read count: {e}")))?;
        Ok(total as u64)
    }

    #[instrument(skip(self, id), fields(outbox_id = %id), err)]
    pub async fn purge_async(&self, id: OutboxId) -> Result<bool, OutboxError> {
        let result = sqlx::query("DELETE FROM outbox_events WHERE id = $1")
            .bind(id.value())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, cutoff), fields(cutoff = %cutoff), err)]
    pub async fn purge_sent_before_async(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError> {
        let result = sqlx::query("DELETE FROM outbox_events WHERE sent = TRUE AND created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_sent_before", e))?;
        Ok(result.rows_affected())
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        self.handle.block_on(self.fetch_unsent_async(limit))
    }

    fn claim_unsent(
        &self,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        self.handle.block_on(self.claim_unsent_async(owner, lease, limit))
    }

    fn mark_sent(&self, id: OutboxId) -> Result<(), OutboxError> {
        self.handle.block_on(self.mark_sent_async(id))
    }

    fn release(&self, id: OutboxId, owner: &str) -> Result<(), OutboxError> {
        self.handle.block_on(self.release_async(id, owner))
    }

    fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>, OutboxError> {
        self.handle.block_on(self.get_async(id))
    }

    fn count_unsent(&self) -> Result<u64, OutboxError> {
        self.handle.block_on(self.count_unsent_async())
    }

    fn purge(&self, id: OutboxId) -> Result<bool, OutboxError> {
        self.handle.block_on(self.purge_async(id))
    }

    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, OutboxError> {
        self.handle.block_on(self.purge_sent_before_async(cutoff))
    }
}

// SQLx row types

#[derive(Debug)]
struct OutboxRow {
    id: i64,
    event_type: String,
    payload: String,
    correlation_id: Option<String>,
    created_at: DateTime<Utc>,
    sent: bool,
    sent_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    claimed_until: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for OutboxRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            correlation_id: row.try_get("correlation_id")?,
            created_at: row.try_get("created_at")?,
            sent: row.try_get("sent")?,
            sent_at: row.try_get("sent_at")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_until: row.try_get("claimed_until")?,
        })
    }
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        OutboxRecord {
            id: OutboxId::new(row.id),
            event_type: row.event_type,
            payload: row.payload,
            correlation_id: row.correlation_id,
            created_at: row.created_at,
            sent: row.sent,
            sent_at: row.sent_at,
            claimed_by: row.claimed_by,
            claimed_until: row.claimed_until,
        }
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, OutboxError> {
    OutboxRow::from_row(row)
        .map(Into::into)
        .map_err(|e| OutboxError::Storage(format!("failed to deserialize outbox row: {e}")))
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<OutboxRecord>, OutboxError> {
    rows.iter().map(decode_row).collect()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    if is_unique_violation(&err) {
        OutboxError::Conflict(describe(operation, &err))
    } else {
        OutboxError::Storage(describe(operation, &err))
    }
}
