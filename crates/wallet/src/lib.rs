//! Wallet domain module.
//!
//! Business rules for wallet balances, implemented as deterministic domain
//! logic (no IO, no storage). Every successful operation returns the event
//! payload that the caller publishes through the outbox.

pub mod wallet;

pub use wallet::Wallet;
