//! Event payloads emitted by wallet operations.
//!
//! Each payload is its own envelope variant: it has its own outbox
//! discriminator, its own destination and its own consumer.

use serde::{Deserialize, Serialize};

use wallethub_core::{Amount, UserId, WalletId};

use crate::saga::{SagaEvent, SagaTrigger};
use crate::Event;

/// A wallet was created for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletCreated {
    pub wallet_id: WalletId,
    pub user_id: UserId,
}

/// Funds were deposited into a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsAdded {
    pub wallet_id: WalletId,
    pub amount: Amount,
}

/// Funds were withdrawn from a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsWithdrawn {
    pub wallet_id: WalletId,
    pub amount: Amount,
}

/// Funds moved between two wallets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsTransferred {
    pub from_wallet_id: WalletId,
    pub to_wallet_id: WalletId,
    pub amount: Amount,
}

impl Event for WalletCreated {
    const EVENT_TYPE: &'static str = "WalletCreated";
}

impl Event for FundsAdded {
    const EVENT_TYPE: &'static str = "FundsAdded";
}

impl Event for FundsWithdrawn {
    const EVENT_TYPE: &'static str = "FundsWithdrawn";
}

impl Event for FundsTransferred {
    const EVENT_TYPE: &'static str = "FundsTransferred";
}

impl SagaTrigger for WalletCreated {
    const SAGA_EVENT: SagaEvent = SagaEvent::WalletCreated;
}

impl SagaTrigger for FundsAdded {
    const SAGA_EVENT: SagaEvent = SagaEvent::FundsAdded;
}

impl SagaTrigger for FundsWithdrawn {
    const SAGA_EVENT: SagaEvent = SagaEvent::FundsWithdrawn;
}

impl SagaTrigger for FundsTransferred {
    const SAGA_EVENT: SagaEvent = SagaEvent::FundsTransferred;
    const COMPLETES_SAGA: bool = true;
}
