//! Postgres-backed saga store.
//!
//! One row per correlation id in `saga_instances`. Writes are compare-and-set
//! on `version`, which makes the row itself the cross-process serialization
//! point for a saga instance.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use wallethub_core::CorrelationId;
use wallethub_events::{SagaInstance, SagaState};

use super::{SagaStore, SagaStoreError};
use crate::pg::describe;

#[derive(Debug, Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    #[instrument(skip(self, correlation_id), fields(correlation_id = %correlation_id), err)]
    pub async fn load_async(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<SagaInstance>, SagaStoreError> {
        let row = sqlx::query(
            r#"
            SELECT correlation_id, current_state, extended_state, version, created_at, updated_at
            FROM saga_instances
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SagaStoreError::Storage(describe("load_saga", &e)))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(
        skip(self, instance),
        fields(
            correlation_id = %instance.correlation_id(),
            state = %instance.current_state(),
            version = instance.version()
        ),
        err
    )]
    pub async fn save_async(
        &self,
        instance: &SagaInstance,
        expected_version: u64,
    ) -> Result<(), SagaStoreError> {
        let extended = JsonValue::Object(instance.extended_state().clone());

        let result = (if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO saga_instances
                    (correlation_id, current_state, extended_state, version, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (correlation_id) DO NOTHING
                "#,
            )
            .bind(instance.correlation_id().as_str())
            .bind(instance.current_state().as_str())
            .bind(&extended)
            .bind(instance.version() as i64)
            .bind(instance.created_at())
            .bind(instance.updated_at())
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE saga_instances
                SET current_state = $2, extended_state = $3, version = $4, updated_at = $5
                WHERE correlation_id = $1 AND version = $6
                "#,
            )
            .bind(instance.correlation_id().as_str())
            .bind(instance.current_state().as_str())
            .bind(&extended)
            .bind(instance.version() as i64)
            .bind(instance.updated_at())
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await
        })
        .map_err(|e| SagaStoreError::Storage(describe("save_saga", &e)))?;

        if result.rows_affected() == 0 {
            return Err(SagaStoreError::Conflict {
                correlation_id: instance.correlation_id().clone(),
                expected: expected_version,
            });
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn list_by_state_async(
        &self,
        state: SagaState,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, SagaStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT correlation_id, current_state, extended_state, version, created_at, updated_at
            FROM saga_instances
            WHERE current_state = $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(state.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SagaStoreError::Storage(describe("list_sagas_by_state", &e)))?;

        rows.iter().map(decode_row).collect()
    }
}

impl SagaStore for PostgresSagaStore {
    fn load(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>, SagaStoreError> {
        self.handle.block_on(self.load_async(correlation_id))
    }

    fn save(&self, instance: &SagaInstance, expected_version: u64) -> Result<(), SagaStoreError> {
        self.handle.block_on(self.save_async(instance, expected_version))
    }

    fn list_by_state(&self, state: SagaState, limit: usize) -> Result<Vec<SagaInstance>, SagaStoreError> {
        self.handle.block_on(self.list_by_state_async(state, limit))
    }
}

// SQLx row types

#[derive(Debug)]
struct SagaRow {
    correlation_id: String,
    current_state: String,
    extended_state: JsonValue,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for SagaRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SagaRow {
            correlation_id: row.try_get("correlation_id")?,
            current_state: row.try_get("current_state")?,
            extended_state: row.try_get("extended_state")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<SagaRow> for SagaInstance {
    type Error = SagaStoreError;

    fn try_from(row: SagaRow) -> Result<Self, Self::Error> {
        let correlation_id = CorrelationId::parse(&row.correlation_id)
            .map_err(|e| SagaStoreError::Corrupt(e.to_string()))?;
        let state: SagaState = row
            .current_state
            .parse()
            .map_err(|e: wallethub_core::DomainError| SagaStoreError::Corrupt(e.to_string()))?;
        let extended = match row.extended_state {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                return Err(SagaStoreError::Corrupt(format!(
                    "extended_state of {correlation_id} is not an object: {other}"
                )));
            }
        };
        let version = u64::try_from(row.version)
            .map_err(|_| SagaStoreError::Corrupt(format!("negative version for {correlation_id}")))?;

        Ok(SagaInstance::restore(
            correlation_id,
            state,
            extended,
            version,
            row.created_at,
            row.updated_at,
        ))
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<SagaInstance, SagaStoreError> {
    let saga_row = SagaRow::from_row(row)
        .map_err(|e| SagaStoreError::Corrupt(format!("failed to deserialize saga row: {e}")))?;
    saga_row.try_into()
}
