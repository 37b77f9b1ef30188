//! Wallet use cases.
//!
//! Every use case runs in exactly one unit of work:
//!
//! ```text
//! begin
//!   ↓
//! 1. Load wallet(s)
//!   ↓
//! 2. Mutate (pure domain decision, produces the event payload)
//!   ↓
//! 3. Save wallet(s)
//!   ↓
//! 4. Record the envelope in the outbox (same unit of work)
//!   ↓
//! commit
//! ```
//!
//! Any error before commit drops the unit of work, which rolls back the
//! wallet change and the outbox record together. Nothing is sent from here;
//! the dispatcher picks the record up after commit.

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use wallethub_core::{AggregateRoot, Amount, CorrelationId, DomainError, UserId, WalletId};
use wallethub_events::{Event, EventEnvelope};
use wallethub_wallet::Wallet;

use crate::outbox::{OutboxId, OutboxPublisher, PublishError};
use crate::unit_of_work::{Database, StoreError, UnitOfWork};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("wallet {0} not found")]
    WalletNotFound(WalletId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// What a committed use case recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Outbox id as reported inside the unit of work. In-memory units of
    /// work report a provisional id here.
    pub outbox_id: OutboxId,
    pub event_type: &'static str,
    pub correlation_id: Option<CorrelationId>,
}

/// Wallet use cases over a [`Database`].
#[derive(Debug)]
pub struct WalletService<D> {
    db: D,
    publisher: OutboxPublisher,
}

impl<D> WalletService<D> {
    pub fn new(db: D) -> Self {
        Self {
            db,
            publisher: OutboxPublisher::new(),
        }
    }

    pub fn with_publisher(mut self, publisher: OutboxPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn database(&self) -> &D {
        &self.db
    }
}

impl<D: Database> WalletService<D> {
    /// Open a wallet for `user_id`.
    ///
    /// A new saga is started: when no correlation id is given, one is
    /// generated and returned in the receipt.
    pub fn create_wallet(
        &self,
        user_id: UserId,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(Wallet, Receipt), ServiceError> {
        let correlation_id = correlation_id.or_else(|| Some(CorrelationId::generate()));
        let mut uow = self.db.begin()?;

        let (wallet, event) = Wallet::create(WalletId::new(), user_id);
        uow.save_wallet(&wallet)?;
        let receipt = self.record(&mut uow, correlation_id, event)?;
        uow.commit()?;

        info!(wallet_id = %wallet.id(), user_id = %user_id, "wallet created");
        Ok((wallet, receipt))
    }

    pub fn add_funds(
        &self,
        wallet_id: WalletId,
        amount: Amount,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(Wallet, Receipt), ServiceError> {
        let mut uow = self.db.begin()?;

        let mut wallet = load(&mut uow, wallet_id)?;
        let event = wallet.add_funds(amount)?;
        uow.save_wallet(&wallet)?;
        let receipt = self.record(&mut uow, correlation_id, event)?;
        uow.commit()?;

        info!(wallet_id = %wallet_id, %amount, balance = %wallet.balance(), "funds added");
        Ok((wallet, receipt))
    }

    pub fn withdraw_funds(
        &self,
        wallet_id: WalletId,
        amount: Amount,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(Wallet, Receipt), ServiceError> {
        let mut uow = self.db.begin()?;

        let mut wallet = load(&mut uow, wallet_id)?;
        let event = wallet.withdraw_funds(amount)?;
        uow.save_wallet(&wallet)?;
        let receipt = self.record(&mut uow, correlation_id, event)?;
        uow.commit()?;

        info!(wallet_id = %wallet_id, %amount, balance = %wallet.balance(), "funds withdrawn");
        Ok((wallet, receipt))
    }

    /// Move `amount` between two wallets; both balances change in the same
    /// unit of work as the `FundsTransferred` record.
    pub fn transfer_funds(
        &self,
        from: WalletId,
        to: WalletId,
        amount: Amount,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(Wallet, Wallet, Receipt), ServiceError> {
        if from == to {
            return Err(DomainError::validation("transfer source and target must differ").into());
        }
        let mut uow = self.db.begin()?;

        let mut source = load(&mut uow, from)?;
        let mut target = load(&mut uow, to)?;
        let event = source.transfer(&mut target, amount)?;
        uow.save_wallet(&source)?;
        uow.save_wallet(&target)?;
        let receipt = self.record(&mut uow, correlation_id, event)?;
        uow.commit()?;

        info!(from = %from, to = %to, %amount, "funds transferred");
        Ok((source, target, receipt))
    }

    /// Committed state of one wallet.
    pub fn wallet(&self, wallet_id: WalletId) -> Result<Option<Wallet>, ServiceError> {
        let mut uow = self.db.begin()?;
        Ok(uow.load_wallet(wallet_id)?)
    }

    fn record<E>(
        &self,
        uow: &mut D::UnitOfWork,
        correlation_id: Option<CorrelationId>,
        event: E,
    ) -> Result<Receipt, ServiceError>
    where
        E: Event + Serialize,
    {
        let envelope = EventEnvelope::new(correlation_id.clone(), event);
        let outbox_id = self.publisher.publish(uow, &envelope)?;
        Ok(Receipt {
            outbox_id,
            event_type: E::EVENT_TYPE,
            correlation_id,
        })
    }
}

fn load<U: UnitOfWork>(uow: &mut U, id: WalletId) -> Result<Wallet, ServiceError> {
    uow.load_wallet(id)?.ok_or(ServiceError::WalletNotFound(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{DestinationRoutes, OutboxStore};
    use crate::unit_of_work::InMemoryDatabase;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn amount(v: i64) -> Amount {
        Amount::new(Decimal::from(v)).unwrap()
    }

    fn service() -> WalletService<Arc<InMemoryDatabase>> {
        WalletService::new(InMemoryDatabase::arc())
    }

    fn corr(raw: &str) -> Option<CorrelationId> {
        Some(CorrelationId::parse(raw).unwrap())
    }

    #[test]
    fn create_wallet_records_one_outbox_entry() {
        let svc = service();
        let (wallet, receipt) = svc.create_wallet(UserId::new(), corr("corr-1")).unwrap();

        assert_eq!(receipt.event_type, "WalletCreated");
        assert_eq!(receipt.correlation_id, corr("corr-1"));

        let records = svc.database().outbox().all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "WalletCreated");
        assert_eq!(records[0].correlation_id.as_deref(), Some("corr-1"));
        assert!(!records[0].sent);
        assert!(records[0].payload.contains(&wallet.id().to_string()));
    }

    #[test]
    fn create_wallet_generates_a_correlation_id_when_none_given() {
        let svc = service();
        let (_, receipt) = svc.create_wallet(UserId::new(), None).unwrap();
        assert!(receipt.correlation_id.is_some());
    }

    #[test]
    fn add_and_withdraw_update_the_balance() {
        let svc = service();
        let (wallet, _) = svc.create_wallet(UserId::new(), corr("c")).unwrap();
        let id = *wallet.id();

        svc.add_funds(id, amount(100), corr("c")).unwrap();
        let (after, _) = svc.withdraw_funds(id, amount(30), corr("c")).unwrap();

        assert_eq!(after.balance(), Decimal::from(70));
        assert_eq!(svc.wallet(id).unwrap().unwrap().balance(), Decimal::from(70));
        assert_eq!(svc.database().outbox().count_unsent().unwrap(), 3);
    }

    #[test]
    fn overdraft_changes_nothing() {
        let svc = service();
        let (wallet, _) = svc.create_wallet(UserId::new(), corr("c")).unwrap();
        let id = *wallet.id();

        let err = svc.withdraw_funds(id, amount(5), corr("c")).unwrap_err();

        assert!(matches!(err, ServiceError::Domain(DomainError::InvariantViolation(_))));
        assert_eq!(svc.wallet(id).unwrap().unwrap().balance(), Decimal::ZERO);
        assert_eq!(svc.database().outbox().count_unsent().unwrap(), 1);
    }

    #[test]
    fn unknown_wallet_is_reported() {
        let svc = service();
        let id = WalletId::new();
        let err = svc.add_funds(id, amount(1), None).unwrap_err();
        assert!(matches!(err, ServiceError::WalletNotFound(missing) if missing == id));
    }

    #[test]
    fn transfer_moves_funds_and_records_one_event() {
        let svc = service();
        let (a, _) = svc.create_wallet(UserId::new(), corr("c")).unwrap();
        let (b, _) = svc.create_wallet(UserId::new(), corr("d")).unwrap();
        svc.add_funds(*a.id(), amount(50), corr("c")).unwrap();

        let (source, target, receipt) = svc
            .transfer_funds(*a.id(), *b.id(), amount(20), corr("c"))
            .unwrap();

        assert_eq!(receipt.event_type, "FundsTransferred");
        assert_eq!(source.balance(), Decimal::from(30));
        assert_eq!(target.balance(), Decimal::from(20));
        assert_eq!(svc.database().outbox().count_unsent().unwrap(), 4);
    }

    #[test]
    fn transfer_to_self_is_rejected() {
        let svc = service();
        let (a, _) = svc.create_wallet(UserId::new(), None).unwrap();
        let err = svc.transfer_funds(*a.id(), *a.id(), amount(1), None).unwrap_err();
        assert!(matches!(err, ServiceError::Domain(DomainError::Validation(_))));
    }

    #[test]
    fn failed_outbox_insert_rolls_back_the_wallet_change() {
        let svc = service();
        let (wallet, _) = svc.create_wallet(UserId::new(), corr("c")).unwrap();
        let id = *wallet.id();

        svc.database().fail_outbox_inserts(true);
        let err = svc.add_funds(id, amount(10), corr("c")).unwrap_err();
        svc.database().fail_outbox_inserts(false);

        assert!(matches!(err, ServiceError::Publish(PublishError::Store(_))));
        assert_eq!(svc.wallet(id).unwrap().unwrap().balance(), Decimal::ZERO);
        assert_eq!(svc.database().outbox().count_unsent().unwrap(), 1);
    }

    #[test]
    fn strict_routing_refuses_before_anything_is_committed() {
        let svc = WalletService::new(InMemoryDatabase::arc())
            .with_publisher(OutboxPublisher::new().with_routes(DestinationRoutes::empty()));

        let err = svc.create_wallet(UserId::new(), None).unwrap_err();

        assert!(matches!(err, ServiceError::Publish(PublishError::Unroutable("WalletCreated"))));
        assert!(svc.database().outbox().all().unwrap().is_empty());
    }
}
