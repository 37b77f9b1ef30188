//! `wallethub-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::AggregateRoot;
pub use error::DomainError;
pub use id::{CorrelationId, EventId, UserId, WalletId};
pub use value_object::{Amount, ValueObject};
