//! Postgres units of work over `sqlx::Transaction`.

use std::collections::HashMap;

use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use wallethub_core::{AggregateRoot, UserId, WalletId};
use wallethub_wallet::Wallet;

use super::{Database, StoreError, UnitOfWork};
use crate::outbox::{NewOutboxRecord, OutboxError, OutboxId, OutboxWriter};
use crate::pg::{describe, is_unique_violation};

/// Connection pool plus the runtime that drives it.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
    handle: Handle,
}

impl PgDatabase {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Database for PgDatabase {
    type UnitOfWork = PgUnitOfWork;

    fn begin(&self) -> Result<Self::UnitOfWork, StoreError> {
        let tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgUnitOfWork {
            handle: self.handle.clone(),
            tx: Some(tx),
            loaded: HashMap::new(),
        })
    }
}

/// One open Postgres transaction.
///
/// Wallet rows are read `FOR UPDATE`, so concurrent units of work touching
/// the same wallet serialize on the row lock. Dropping without commit rolls
/// back.
pub struct PgUnitOfWork {
    handle: Handle,
    tx: Option<Transaction<'static, Postgres>>,
    loaded: HashMap<WalletId, u64>,
}

impl PgUnitOfWork {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Storage("unit of work already finished".into()))
    }

    #[instrument(skip(self, id), fields(wallet_id = %id), err)]
    async fn load_wallet_async(&mut self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        let tx = self.tx()?;
        let row = sqlx::query(
            r#"
            SELECT id, user_id, balance, version
            FROM wallets
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_wallet", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let wallet_row = WalletRow {
            id: row.try_get("id").map_err(|e| corrupt("id", e))?,
            user_id: row.try_get("user_id").map_err(|e| corrupt("user_id", e))?,
            balance: row.try_get("balance").map_err(|e| corrupt("balance", e))?,
            version: row.try_get("version").map_err(|e| corrupt("version", e))?,
        };
        let wallet = wallet_row.into_wallet()?;
        self.loaded.insert(id, wallet.version());
        Ok(Some(wallet))
    }

    #[instrument(skip(self, wallet), fields(wallet_id = %wallet.id(), version = wallet.version()), err)]
    async fn save_wallet_async(&mut self, wallet: &Wallet) -> Result<(), StoreError> {
        let id = *wallet.id();
        let expected = self.loaded.get(&id).copied();
        let tx = self.tx()?;

        match expected {
            Some(expected) => {
                let result = sqlx::query(
                    r#"
                    UPDATE wallets
                    SET balance = $2, version = $3, updated_at = now()
                    WHERE id = $1 AND version = $4
                    "#,
                )
                .bind(id.as_uuid())
                .bind(wallet.balance())
                .bind(wallet.version() as i64)
                .bind(expected as i64)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("update_wallet", e))?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::Conflict(format!(
                        "wallet {id} changed concurrently (expected version {expected})"
                    )));
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO wallets (id, user_id, balance, version)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(id.as_uuid())
                .bind(wallet.user_id().as_uuid())
                .bind(wallet.balance())
                .bind(wallet.version() as i64)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("insert_wallet", e))?;
            }
        }

        self.loaded.insert(id, wallet.version());
        Ok(())
    }

    #[instrument(skip(self, record), fields(event_type = %record.event_type), err)]
    async fn insert_outbox_async(&mut self, record: NewOutboxRecord) -> Result<OutboxId, OutboxError> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| OutboxError::Storage("unit of work already finished".into()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO outbox_events (event_type, payload, correlation_id, sent)
            VALUES ($1, $2, $3, FALSE)
            RETURNING id
            "#,
        )
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.correlation_id.as_deref())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| OutboxError::Storage(describe("insert_outbox", &e)))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| OutboxError::Storage(format!("failed to read outbox id: {e}")))?;
        Ok(OutboxId::new(id))
    }
}

impl UnitOfWork for PgUnitOfWork {
    fn load_wallet(&mut self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        let handle = self.handle.clone();
        handle.block_on(self.load_wallet_async(id))
    }

    fn save_wallet(&mut self, wallet: &Wallet) -> Result<(), StoreError> {
        let handle = self.handle.clone();
        handle.block_on(self.save_wallet_async(wallet))
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Storage("unit of work already finished".into()))?;
        self.handle
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

impl OutboxWriter for PgUnitOfWork {
    fn insert_outbox(&mut self, record: NewOutboxRecord) -> Result<OutboxId, OutboxError> {
        let handle = self.handle.clone();
        handle.block_on(self.insert_outbox_async(record))
    }
}

impl Drop for PgUnitOfWork {
    fn drop(&mut self) {
        // Rolling back returns the connection to the pool, which needs the runtime.
        if let Some(tx) = self.tx.take() {
            let _guard = self.handle.enter();
            drop(tx);
        }
    }
}

#[derive(Debug)]
struct WalletRow {
    id: uuid::Uuid,
    user_id: uuid::Uuid,
    balance: Decimal,
    version: i64,
}

impl WalletRow {
    fn into_wallet(self) -> Result<Wallet, StoreError> {
        let version = u64::try_from(self.version)
            .map_err(|_| StoreError::Corrupt(format!("wallet {} has negative version", self.id)))?;
        Wallet::restore(
            WalletId::from_uuid(self.id),
            UserId::from_uuid(self.user_id),
            self.balance,
            version,
        )
        .map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

fn corrupt(column: &str, err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to read wallets.{column}: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict(describe(operation, &err))
    } else {
        StoreError::Storage(describe(operation, &err))
    }
}
