//! Redis Streams-backed message channel (durable, at-least-once delivery).
//!
//! - **One stream per destination**: `wallethub:<destination>`
//! - **Send**: `XADD` with `message_id`, `event_type`, `correlation_id` (when
//!   present) and `payload` fields; an entry id back within the timeout is
//!   the acknowledgment
//! - **Subscribe**: one consumer group shared by all relay instances, one
//!   reader thread per subscription doing `XREADGROUP`
//! - **Ack**: an entry is `XACK`ed only after the subscriber calls
//!   [`Subscription::ack`] for it; until then it stays pending
//! - **Restart**: a reader first walks its own pending entries (`0`) before
//!   asking for new ones (`>`)
//! - **Reclaim**: entries pending longer than the claim idle time, on any
//!   consumer of the group, are taken over with `XAUTOCLAIM` and delivered
//!   again; this covers crashed instances and failed saga updates
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use wallethub_events::{
    ChannelError, ChannelMessage, Delivery, MessageChannel, MessageHeaders, Subscription,
};

/// Stream key prefix; the destination name follows.
const DEFAULT_STREAM_PREFIX: &str = "wallethub:";

/// Entries fetched per `XREADGROUP`.
const READ_COUNT: usize = 10;

/// How long one `XREADGROUP` blocks waiting for entries.
const READ_BLOCK: Duration = Duration::from_millis(500);

/// Pause after a failed read before reconnecting.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Pending time after which an unacknowledged entry is reclaimed.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

/// How often a reader looks for stale pending entries.
const RECLAIM_EVERY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RedisStreamsChannel {
    client: Arc<redis::Client>,
    stream_prefix: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
    closed: Arc<AtomicBool>,
}

impl RedisStreamsChannel {
    /// Open a channel against `redis_url`. Nothing is contacted until the
    /// first send or subscribe.
    pub fn new(redis_url: impl AsRef<str>, group: impl Into<String>) -> Result<Self, ChannelError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            group: group.into(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            claim_idle: DEFAULT_CLAIM_IDLE,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    /// Consumer name inside the group. Keep it stable across restarts so
    /// pending entries are picked up again.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// How long an entry may stay unacknowledged before any reader of the
    /// group takes it over.
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn stream_key(&self, destination: &str) -> String {
        format!("{}{}", self.stream_prefix, destination)
    }

    /// Stop every reader thread after its current read.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    #[instrument(
        skip(self, destination, message, timeout),
        fields(destination = %destination, message_id = %message.headers.message_id),
        err
    )]
    fn xadd(
        &self,
        destination: &str,
        message: &ChannelMessage,
        timeout: Duration,
    ) -> Result<String, ChannelError> {
        let mut conn = self
            .client
            .get_connection_with_timeout(timeout)
            .map_err(|e| map_redis_error(e, timeout))?;
        conn.set_read_timeout(Some(timeout))
            .and_then(|_| conn.set_write_timeout(Some(timeout)))
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(destination))
            .arg("*")
            .arg("message_id")
            .arg(&message.headers.message_id)
            .arg("event_type")
            .arg(&message.headers.event_type);
        if let Some(correlation_id) = &message.headers.correlation_id {
            cmd.arg("correlation_id").arg(correlation_id);
        }
        cmd.arg("payload").arg(&message.payload);

        cmd.query::<String>(&mut conn)
            .map_err(|e| map_redis_error(e, timeout))
    }
}

impl MessageChannel for RedisStreamsChannel {
    fn send(
        &self,
        destination: &str,
        message: ChannelMessage,
        timeout: Duration,
    ) -> Result<Delivery, ChannelError> {
        let entry_id = self.xadd(destination, &message, timeout)?;
        debug!(destination, entry_id = %entry_id, "stream entry added");
        Ok(Delivery::Acked)
    }

    fn subscribe(&self, destination: &str) -> Subscription<ChannelMessage> {
        let (tx, rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        let reader = StreamReader {
            client: self.client.clone(),
            stream_key: self.stream_key(destination),
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            claim_idle: self.claim_idle,
            closed: self.closed.clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("redis-reader-{destination}"))
            .spawn(move || reader.run(tx, ack_rx));
        if let Err(e) = spawned {
            // The receiver disconnects immediately; the worker sees that.
            error!(destination, error = %e, "failed to spawn stream reader");
        }

        Subscription::with_acks(rx, ack_tx)
    }
}

fn map_redis_error(err: redis::RedisError, timeout: Duration) -> ChannelError {
    if err.is_timeout() {
        ChannelError::Timeout(timeout)
    } else if err.is_connection_refusal() || err.is_connection_dropped() {
        ChannelError::Unavailable(err.to_string())
    } else {
        ChannelError::Transport(err.to_string())
    }
}

struct StreamReader {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
    closed: Arc<AtomicBool>,
}

/// Where the next `XREADGROUP` starts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    /// Own pending entries after this id.
    Pending(String),
    /// Entries never delivered to the group.
    New,
}

impl Cursor {
    fn start() -> Self {
        Cursor::Pending("0".to_string())
    }

    fn as_arg(&self) -> &str {
        match self {
            Cursor::Pending(after) => after,
            Cursor::New => ">",
        }
    }

    /// Walk the pending list one page at a time, then switch to new entries.
    fn advance(self, last_id: Option<&str>) -> Self {
        match (self, last_id) {
            (Cursor::Pending(_), Some(id)) => Cursor::Pending(id.to_string()),
            _ => Cursor::New,
        }
    }
}

impl StreamReader {
    fn run(self, tx: mpsc::Sender<ChannelMessage>, acks: mpsc::Receiver<String>) {
        let mut cursor = Cursor::start();
        let mut reclaim_from = "0-0".to_string();
        let mut last_reclaim = Instant::now();

        while !self.closed.load(Ordering::SeqCst) {
            let mut conn = match self.connect() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(stream = %self.stream_key, error = %e, "stream reader cannot connect");
                    thread::sleep(RECONNECT_BACKOFF);
                    continue;
                }
            };

            while !self.closed.load(Ordering::SeqCst) {
                self.flush_acks(&mut conn, &acks);

                let entries = if cursor == Cursor::New && last_reclaim.elapsed() >= RECLAIM_EVERY {
                    last_reclaim = Instant::now();
                    match self.reclaim(&mut conn, &reclaim_from) {
                        Ok((next, entries)) => {
                            if !entries.is_empty() {
                                info!(stream = %self.stream_key, count = entries.len(), "reclaimed stale pending entries");
                            }
                            reclaim_from = next;
                            entries
                        }
                        Err(e) => {
                            warn!(stream = %self.stream_key, error = %e, "XAUTOCLAIM failed");
                            thread::sleep(RECONNECT_BACKOFF);
                            break;
                        }
                    }
                } else {
                    match self.read(&mut conn, cursor.as_arg()) {
                        Ok(entries) => {
                            let last_id = entries.last().map(|e| e.id.clone());
                            cursor = cursor.advance(last_id.as_deref());
                            entries
                        }
                        Err(e) => {
                            warn!(stream = %self.stream_key, error = %e, "XREADGROUP failed");
                            thread::sleep(RECONNECT_BACKOFF);
                            break;
                        }
                    }
                };

                for entry in entries {
                    match entry.into_message() {
                        Ok((entry_id, message)) => {
                            if tx.send(message.with_receipt(entry_id)).is_err() {
                                debug!(stream = %self.stream_key, "subscription dropped");
                                return;
                            }
                        }
                        Err((entry_id, reason)) => {
                            // Cannot be represented as a message; ack so it stops coming back.
                            error!(stream = %self.stream_key, entry_id = %entry_id, reason, "malformed stream entry");
                            self.ack(&mut conn, &entry_id);
                        }
                    }
                }
            }

            if self.closed.load(Ordering::SeqCst) {
                self.flush_acks(&mut conn, &acks);
            }
        }
    }

    fn connect(&self) -> redis::RedisResult<redis::Connection> {
        let mut conn = self.client.get_connection()?;

        // BUSYGROUP means it already exists.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        if let Err(e) = created {
            if e.code() != Some("BUSYGROUP") {
                return Err(e);
            }
        }
        Ok(conn)
    }

    fn read(&self, conn: &mut redis::Connection, cursor: &str) -> redis::RedisResult<Vec<RawEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT);
        if cursor == ">" {
            cmd.arg("BLOCK").arg(READ_BLOCK.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(cursor);

        let reply: redis::Value = cmd.query(conn)?;
        Ok(parse_read_reply(reply))
    }

    /// Take over entries that stayed pending longer than `claim_idle`.
    fn reclaim(
        &self,
        conn: &mut redis::Connection,
        from: &str,
    ) -> redis::RedisResult<(String, Vec<RawEntry>)> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg(from)
            .arg("COUNT")
            .arg(READ_COUNT)
            .query(conn)?;
        Ok(parse_autoclaim_reply(reply))
    }

    fn flush_acks(&self, conn: &mut redis::Connection, acks: &mpsc::Receiver<String>) {
        for entry_id in acks.try_iter() {
            self.ack(conn, &entry_id);
        }
    }

    fn ack(&self, conn: &mut redis::Connection, entry_id: &str) {
        let acked: redis::RedisResult<u64> = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .query(conn);
        if let Err(e) = acked {
            warn!(stream = %self.stream_key, entry_id, error = %e, "XACK failed; entry will be redelivered");
        }
    }
}

/// One stream entry as read: id plus its field map.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawEntry {
    id: String,
    fields: HashMap<String, String>,
}

impl RawEntry {
    fn into_message(mut self) -> Result<(String, ChannelMessage), (String, &'static str)> {
        let Some(payload) = self.fields.remove("payload") else {
            return Err((self.id, "missing payload field"));
        };
        let Some(event_type) = self.fields.remove("event_type") else {
            return Err((self.id, "missing event_type field"));
        };
        let message_id = self
            .fields
            .remove("message_id")
            .unwrap_or_else(|| self.id.clone());

        let headers = MessageHeaders {
            message_id,
            event_type,
            correlation_id: self.fields.remove("correlation_id"),
        };
        Ok((self.id, ChannelMessage::new(headers, payload)))
    }
}

/// Flatten an `XREADGROUP` reply.
///
/// Shape: `[[stream_key, [[entry_id, [field, value, ...]], ...]], ...]`, or
/// nil when the block timed out. Pending entries that were deleted come back
/// with a nil field list; they are kept with no fields so the reader acks
/// them as malformed.
fn parse_read_reply(reply: redis::Value) -> Vec<RawEntry> {
    let mut out = Vec::new();
    let redis::Value::Bulk(streams) = reply else {
        return out;
    };

    for stream in streams {
        let redis::Value::Bulk(mut parts) = stream else {
            continue;
        };
        if parts.len() < 2 {
            continue;
        }
        let redis::Value::Bulk(entries) = parts.swap_remove(1) else {
            continue;
        };
        out.extend(entries.into_iter().filter_map(parse_entry));
    }
    out
}

fn parse_entry(entry: redis::Value) -> Option<RawEntry> {
    let redis::Value::Bulk(mut parts) = entry else {
        return None;
    };
    if parts.len() < 2 {
        return None;
    }
    let raw_fields = match parts.swap_remove(1) {
        redis::Value::Bulk(raw_fields) => raw_fields,
        redis::Value::Nil => Vec::new(),
        _ => return None,
    };
    let id = as_string(&parts[0])?;

    let fields = raw_fields
        .chunks(2)
        .filter_map(|pair| match pair {
            [k, v] => Some((as_string(k)?, as_string(v)?)),
            _ => None,
        })
        .collect();

    Some(RawEntry { id, fields })
}

/// Split an `XAUTOCLAIM` reply into the next start id and the claimed entries.
///
/// Shape: `[next_start, [[entry_id, [field, value, ...]], ...], [deleted_id, ...]]`;
/// the deleted list is absent before Redis 7. A next start of `0-0` means the
/// scan wrapped around.
fn parse_autoclaim_reply(reply: redis::Value) -> (String, Vec<RawEntry>) {
    let redis::Value::Bulk(mut parts) = reply else {
        return ("0-0".to_string(), Vec::new());
    };
    if parts.len() < 2 {
        return ("0-0".to_string(), Vec::new());
    }
    let entries = match parts.swap_remove(1) {
        redis::Value::Bulk(entries) => entries.into_iter().filter_map(parse_entry).collect(),
        _ => Vec::new(),
    };
    let next = as_string(&parts[0]).unwrap_or_else(|| "0-0".to_string());
    (next, entries)
}

fn as_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}
