//! Message channel abstraction (mechanics only).
//!
//! The channel is the transport between the outbox dispatcher and the event
//! consumers. It is deliberately small:
//!
//! - **Named destinations**: each envelope variant is delivered to its own
//!   destination; each consumer subscribes to exactly one.
//! - **Explicit acknowledgment**: `send` returns a [`Delivery`] so the caller
//!   can tell "accepted" from "refused" from "broken".
//! - **Bounded sends**: every send carries a timeout, so a hung transport
//!   cannot stall the caller indefinitely.
//! - **At-least-once**: subscribers may see the same message more than once.
//!   A subscriber acknowledges a message with [`Subscription::ack`] once it is
//!   handled; transports that track consumption deliver unacknowledged
//!   messages again.
//!
//! ## Headers
//!
//! The correlation id travels as its own header, independent of the payload
//! body, so consumers can branch on it without deserializing the payload.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level attributes carried next to the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// Stable id of the message: the outbox record id it was dispatched from.
    pub message_id: String,
    /// Outbox discriminator of the serialized payload.
    pub event_type: String,
    /// Raw correlation id; `None` when the envelope had none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// One message on the wire: headers plus the serialized envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub headers: MessageHeaders,
    pub payload: String,
    /// Transport position of this delivery (a stream entry id), set by
    /// channels that wait for [`Subscription::ack`]. Never sent on the wire.
    #[serde(skip)]
    pub receipt: Option<String>,
}

impl ChannelMessage {
    pub fn new(headers: MessageHeaders, payload: impl Into<String>) -> Self {
        Self {
            headers,
            payload: payload.into(),
            receipt: None,
        }
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }
}

/// Outcome of a send that reached the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The transport took ownership of the message.
    Acked,
    /// The transport answered but refused the message.
    Rejected(String),
}

impl Delivery {
    pub fn is_acked(&self) -> bool {
        matches!(self, Delivery::Acked)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

/// A subscription to one destination.
///
/// ```ignore
/// let subscription = channel.subscribe("wallet-created-topic");
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(200)) {
///         Ok(message) => {
///             handle(&message);
///             subscription.ack(&message);
///         }
///         Err(RecvTimeoutError::Timeout) => continue,      // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,    // channel closed
///     }
/// }
/// ```
///
/// Subscriptions are meant to be drained by a single thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
    acks: Option<Sender<String>>,
}

impl<M> Subscription<M> {
    /// A subscription whose transport needs no acknowledgment.
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver, acks: None }
    }

    /// A subscription that reports receipts of handled messages on `acks`.
    pub fn with_acks(receiver: Receiver<M>, acks: Sender<String>) -> Self {
        Self {
            receiver,
            acks: Some(acks),
        }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl Subscription<ChannelMessage> {
    /// Confirm that `message` was handled and need not be delivered again.
    ///
    /// No-op for transports without acknowledgment and for messages that
    /// carry no receipt.
    pub fn ack(&self, message: &ChannelMessage) {
        if let (Some(acks), Some(receipt)) = (&self.acks, &message.receipt) {
            // The transport side is gone; the message comes back after a restart.
            let _ = acks.send(receipt.clone());
        }
    }
}

/// Destination-addressed message channel.
///
/// `send` must not return `Ok(Delivery::Acked)` unless the transport has
/// taken the message; the dispatcher flips an outbox record to sent on
/// nothing else.
pub trait MessageChannel: Send + Sync {
    fn send(
        &self,
        destination: &str,
        message: ChannelMessage,
        timeout: Duration,
    ) -> Result<Delivery, ChannelError>;

    fn subscribe(&self, destination: &str) -> Subscription<ChannelMessage>;
}

impl<C> MessageChannel for Arc<C>
where
    C: MessageChannel + ?Sized,
{
    fn send(
        &self,
        destination: &str,
        message: ChannelMessage,
        timeout: Duration,
    ) -> Result<Delivery, ChannelError> {
        (**self).send(destination, message, timeout)
    }

    fn subscribe(&self, destination: &str) -> Subscription<ChannelMessage> {
        (**self).subscribe(destination)
    }
}
