//! Message channel transports.
//!
//! The in-memory channel lives in `wallethub-events`; networked transports
//! live here behind cargo features.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsChannel;
