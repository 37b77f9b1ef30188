//! In-memory database for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use wallethub_core::{AggregateRoot, WalletId};
use wallethub_wallet::Wallet;

use super::{Database, StoreError, UnitOfWork};
use crate::outbox::{InMemoryOutboxStore, NewOutboxRecord, OutboxError, OutboxId, OutboxWriter};

/// Wallet table plus outbox table.
///
/// Units of work stage their writes privately and apply them at commit
/// under the wallet table's write lock, so readers never observe a wallet
/// change without its outbox record or the other way round.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    wallets: RwLock<HashMap<WalletId, Wallet>>,
    outbox: Arc<InMemoryOutboxStore>,
    fail_outbox_inserts: AtomicBool,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The outbox table, for dispatchers and assertions.
    pub fn outbox(&self) -> Arc<InMemoryOutboxStore> {
        self.outbox.clone()
    }

    /// Committed wallet state.
    pub fn wallet(&self, id: WalletId) -> Option<Wallet> {
        self.wallets.read().ok().and_then(|w| w.get(&id).cloned())
    }

    /// Make every outbox insert fail, to exercise rollback.
    pub fn fail_outbox_inserts(&self, fail: bool) {
        self.fail_outbox_inserts.store(fail, Ordering::SeqCst);
    }
}

impl Database for Arc<InMemoryDatabase> {
    type UnitOfWork = InMemoryUnitOfWork;

    fn begin(&self) -> Result<Self::UnitOfWork, StoreError> {
        Ok(InMemoryUnitOfWork {
            db: self.clone(),
            loaded: HashMap::new(),
            wallets: HashMap::new(),
            outbox: Vec::new(),
            staged_ids: 0,
        })
    }
}

/// Staged changes of one in-memory transaction.
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    db: Arc<InMemoryDatabase>,
    /// Versions as read, for the commit-time concurrency check.
    loaded: HashMap<WalletId, Option<u64>>,
    wallets: HashMap<WalletId, Wallet>,
    outbox: Vec<NewOutboxRecord>,
    staged_ids: i64,
}

impl UnitOfWork for InMemoryUnitOfWork {
    fn load_wallet(&mut self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        if let Some(staged) = self.wallets.get(&id) {
            return Ok(Some(staged.clone()));
        }
        let wallets = self
            .db
            .wallets
            .read()
            .map_err(|_| StoreError::Storage("wallet table lock poisoned".into()))?;
        let found = wallets.get(&id).cloned();
        self.loaded
            .entry(id)
            .or_insert_with(|| found.as_ref().map(|w| w.version()));
        Ok(found)
    }

    fn save_wallet(&mut self, wallet: &Wallet) -> Result<(), StoreError> {
        self.wallets.insert(*wallet.id(), wallet.clone());
        Ok(())
    }

    fn commit(self) -> Result<(), StoreError> {
        let mut wallets = self
            .db
            .wallets
            .write()
            .map_err(|_| StoreError::Storage("wallet table lock poisoned".into()))?;

        for id in self.wallets.keys() {
            let current = wallets.get(id).map(|w| w.version());
            let expected = self.loaded.get(id).copied().unwrap_or(None);
            if current != expected {
                return Err(StoreError::Conflict(format!(
                    "wallet {id} changed concurrently (expected {expected:?}, found {current:?})"
                )));
            }
        }

        self.db.outbox.insert_all(self.outbox)?;
        wallets.extend(self.wallets);
        Ok(())
    }
}

impl OutboxWriter for InMemoryUnitOfWork {
    fn insert_outbox(&mut self, record: NewOutboxRecord) -> Result<OutboxId, OutboxError> {
        if self.db.fail_outbox_inserts.load(Ordering::SeqCst) {
            return Err(OutboxError::Storage("outbox insert failed (injected)".into()));
        }
        self.outbox.push(record);
        self.staged_ids += 1;
        // Provisional id; the table assigns the real one at commit.
        Ok(OutboxId::new(-self.staged_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxStore;
    use rust_decimal::Decimal;
    use wallethub_core::{Amount, UserId};

    fn record() -> NewOutboxRecord {
        NewOutboxRecord {
            event_type: "WalletCreated".into(),
            payload: "{}".into(),
            correlation_id: None,
        }
    }

    #[test]
    fn commit_applies_wallet_and_outbox_together() {
        let db = InMemoryDatabase::arc();
        let (wallet, _) = Wallet::create(WalletId::new(), UserId::new());

        let mut uow = db.begin().unwrap();
        uow.save_wallet(&wallet).unwrap();
        uow.insert_outbox(record()).unwrap();
        uow.commit().unwrap();

        assert_eq!(db.wallet(*wallet.id()), Some(wallet));
        assert_eq!(db.outbox().count_unsent().unwrap(), 1);
    }

    #[test]
    fn dropping_discards_everything() {
        let db = InMemoryDatabase::arc();
        let (wallet, _) = Wallet::create(WalletId::new(), UserId::new());

        {
            let mut uow = db.begin().unwrap();
            uow.save_wallet(&wallet).unwrap();
            uow.insert_outbox(record()).unwrap();
        }

        assert_eq!(db.wallet(*wallet.id()), None);
        assert_eq!(db.outbox().count_unsent().unwrap(), 0);
    }

    #[test]
    fn concurrent_update_is_a_conflict() {
        let db = InMemoryDatabase::arc();
        let (wallet, _) = Wallet::create(WalletId::new(), UserId::new());
        let id = *wallet.id();
        let mut seed = db.begin().unwrap();
        seed.save_wallet(&wallet).unwrap();
        seed.commit().unwrap();

        let amount = Amount::new(Decimal::ONE).unwrap();
        let mut first = db.begin().unwrap();
        let mut second = db.begin().unwrap();
        let mut a = first.load_wallet(id).unwrap().unwrap();
        let mut b = second.load_wallet(id).unwrap().unwrap();
        a.add_funds(amount).unwrap();
        b.add_funds(amount).unwrap();
        first.save_wallet(&a).unwrap();
        second.save_wallet(&b).unwrap();
        second.insert_outbox(record()).unwrap();

        first.commit().unwrap();
        assert!(matches!(second.commit(), Err(StoreError::Conflict(_))));
        assert_eq!(db.wallet(id).unwrap().balance(), Decimal::ONE);
        assert_eq!(db.outbox().count_unsent().unwrap(), 0);
    }
}
