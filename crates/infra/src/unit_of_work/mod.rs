//! Units of work: one local transaction spanning wallet rows and the outbox.
//!
//! A unit of work is opened with [`Database::begin`], staged through its
//! methods and made durable with [`UnitOfWork::commit`]. Dropping it without
//! committing discards every staged change, outbox records included.

pub mod in_memory;
pub mod postgres;

use thiserror::Error;

use wallethub_core::WalletId;
use wallethub_wallet::Wallet;

use crate::outbox::{OutboxError, OutboxWriter};

pub use in_memory::{InMemoryDatabase, InMemoryUnitOfWork};
pub use postgres::{PgDatabase, PgUnitOfWork};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Optimistic concurrency failure or duplicate key.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// A stored row could not be mapped back into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<OutboxError> for StoreError {
    fn from(value: OutboxError) -> Self {
        match value {
            OutboxError::Conflict(msg) => StoreError::Conflict(msg),
            other => StoreError::Storage(other.to_string()),
        }
    }
}

/// One open local transaction.
pub trait UnitOfWork: OutboxWriter {
    fn load_wallet(&mut self, id: WalletId) -> Result<Option<Wallet>, StoreError>;

    /// Insert or update. Updates are checked against the version loaded in
    /// this unit of work.
    fn save_wallet(&mut self, wallet: &Wallet) -> Result<(), StoreError>;

    fn commit(self) -> Result<(), StoreError>;
}

/// Opens units of work.
pub trait Database: Send + Sync {
    type UnitOfWork: UnitOfWork;

    fn begin(&self) -> Result<Self::UnitOfWork, StoreError>;
}
