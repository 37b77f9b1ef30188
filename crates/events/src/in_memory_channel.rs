//! In-memory message channel for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};
use std::time::Duration;

use tracing::debug;

use crate::channel::{ChannelError, ChannelMessage, Delivery, MessageChannel, Subscription};

#[derive(Debug, Default)]
struct Topic {
    subscribers: Vec<mpsc::Sender<ChannelMessage>>,
    /// Messages accepted while nobody was subscribed; flushed to the first subscriber.
    backlog: Vec<ChannelMessage>,
}

/// In-memory destination-addressed channel.
///
/// - No IO / no async
/// - Fan-out to every subscriber of a destination
/// - Messages sent before anyone subscribes are retained, like a durable topic
/// - Outages are simulated with [`set_available`](Self::set_available) (transport
///   error) and [`set_rejecting`](Self::set_rejecting) (negative acknowledgment)
#[derive(Debug)]
pub struct InMemoryChannel {
    topics: Mutex<HashMap<String, Topic>>,
    history: Mutex<Vec<(String, ChannelMessage)>>,
    available: AtomicBool,
    rejecting: AtomicBool,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` makes every send fail with [`ChannelError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// `true` makes every send answer [`Delivery::Rejected`].
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Every accepted message, in send order, with its destination.
    pub fn sent(&self) -> Vec<(String, ChannelMessage)> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Accepted messages for one destination.
    pub fn sent_to(&self, destination: &str) -> Vec<ChannelMessage> {
        self.sent()
            .into_iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, message)| message)
            .collect()
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            rejecting: AtomicBool::new(false),
        }
    }
}

impl MessageChannel for InMemoryChannel {
    fn send(
        &self,
        destination: &str,
        message: ChannelMessage,
        _timeout: Duration,
    ) -> Result<Delivery, ChannelError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable(format!(
                "destination '{destination}' is down"
            )));
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Ok(Delivery::Rejected(format!(
                "destination '{destination}' refused the message"
            )));
        }

        let mut topics = self
            .topics
            .lock()
            .map_err(|_| ChannelError::Transport("topic registry poisoned".into()))?;
        let topic = topics.entry(destination.to_string()).or_default();

        // Drop any dead subscribers while sending.
        topic
            .subscribers
            .retain(|tx| tx.send(message.clone()).is_ok());
        if topic.subscribers.is_empty() {
            debug!(destination, message_id = %message.headers.message_id, "no subscriber; message retained");
            topic.backlog.push(message.clone());
        }

        if let Ok(mut history) = self.history.lock() {
            history.push((destination.to_string(), message));
        }
        Ok(Delivery::Acked)
    }

    fn subscribe(&self, destination: &str) -> Subscription<ChannelMessage> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned we still return a subscription;
        // it just won't receive messages.
        if let Ok(mut topics) = self.topics.lock() {
            let topic = topics.entry(destination.to_string()).or_default();
            for message in topic.backlog.drain(..) {
                let _ = tx.send(message);
            }
            topic.subscribers.push(tx);
        }

        Subscription::new(rx)
    }
}
