//! Wallet events, the saga vocabulary and the message channel abstraction.
//!
//! Everything in this crate is pure mechanics: no storage, no network.

pub mod channel;
pub mod envelope;
pub mod event;
pub mod in_memory_channel;
pub mod saga;
pub mod wallet_events;

pub use channel::{ChannelError, ChannelMessage, Delivery, MessageChannel, MessageHeaders, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_channel::InMemoryChannel;
pub use saga::{
    Rejection, RejectionReason, SagaEvent, SagaInstance, SagaState, SagaTrigger, Transition,
    TRANSITIONS, next_state,
};
pub use wallet_events::{FundsAdded, FundsTransferred, FundsWithdrawn, WalletCreated};
