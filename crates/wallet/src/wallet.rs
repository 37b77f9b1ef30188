use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use wallethub_core::{AggregateRoot, Amount, DomainError, UserId, WalletId};
use wallethub_events::{FundsAdded, FundsTransferred, FundsWithdrawn, WalletCreated};

/// Aggregate root: Wallet.
///
/// The balance never goes negative. `version` counts applied mutations and is
/// used by stores for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    id: WalletId,
    user_id: UserId,
    balance: Decimal,
    version: u64,
}

impl Wallet {
    /// Open a wallet with a zero balance.
    pub fn create(id: WalletId, user_id: UserId) -> (Self, WalletCreated) {
        let wallet = Self {
            id,
            user_id,
            balance: Decimal::ZERO,
            version: 1,
        };
        let event = WalletCreated {
            wallet_id: id,
            user_id,
        };
        (wallet, event)
    }

    /// Rehydrate from storage.
    pub fn restore(
        id: WalletId,
        user_id: UserId,
        balance: Decimal,
        version: u64,
    ) -> Result<Self, DomainError> {
        if balance < Decimal::ZERO {
            return Err(DomainError::invariant(format!(
                "wallet {id} stored with negative balance {balance}"
            )));
        }
        Ok(Self {
            id,
            user_id,
            balance,
            version,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn add_funds(&mut self, amount: Amount) -> Result<FundsAdded, DomainError> {
        self.credit(amount)?;
        Ok(FundsAdded {
            wallet_id: self.id,
            amount,
        })
    }

    pub fn withdraw_funds(&mut self, amount: Amount) -> Result<FundsWithdrawn, DomainError> {
        self.debit(amount)?;
        Ok(FundsWithdrawn {
            wallet_id: self.id,
            amount,
        })
    }

    /// Move `amount` from `self` to `target`.
    ///
    /// Both wallets are validated before either is touched, so a failed
    /// transfer leaves both unchanged.
    pub fn transfer(
        &mut self,
        target: &mut Wallet,
        amount: Amount,
    ) -> Result<FundsTransferred, DomainError> {
        if self.id == target.id {
            return Err(DomainError::validation(
                "transfer source and target must differ",
            ));
        }
        self.ensure_covers(amount)?;
        target.ensure_can_credit(amount)?;

        self.debit(amount)?;
        target.credit(amount)?;

        Ok(FundsTransferred {
            from_wallet_id: self.id,
            to_wallet_id: target.id,
            amount,
        })
    }

    fn ensure_covers(&self, amount: Amount) -> Result<(), DomainError> {
        if amount.value() > self.balance {
            return Err(DomainError::invariant(format!(
                "insufficient funds: balance {}, requested {amount}",
                self.balance
            )));
        }
        Ok(())
    }

    fn ensure_can_credit(&self, amount: Amount) -> Result<(), DomainError> {
        self.balance
            .checked_add(amount.value())
            .map(|_| ())
            .ok_or_else(|| DomainError::invariant("balance overflow"))
    }

    fn credit(&mut self, amount: Amount) -> Result<(), DomainError> {
        self.balance = self
            .balance
            .checked_add(amount.value())
            .ok_or_else(|| DomainError::invariant("balance overflow"))?;
        self.version += 1;
        Ok(())
    }

    fn debit(&mut self, amount: Amount) -> Result<(), DomainError> {
        self.ensure_covers(amount)?;
        self.balance -= amount.value();
        self.version += 1;
        Ok(())
    }
}

impl AggregateRoot for Wallet {
    type Id = WalletId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
