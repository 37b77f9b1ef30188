//! Configuration loading and representation.
//!
//! Everything is read from environment variables with documented defaults.
//! Parsing goes through a lookup function so tests never touch the process
//! environment.

use std::time::Duration;

use thiserror::Error;

use crate::outbox::DestinationRoutes;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_LEASE_MS: u64 = 30_000;
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_CONSUMER_GROUP: &str = "wallethub-saga";
pub const DEFAULT_CONSUMER_NAME: &str = "wallethub-relay";
pub const DEFAULT_CLAIM_IDLE_MS: u64 = 60_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Outbox dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Thread name and log label.
    pub name: String,
    /// Lease owner written to `claimed_by`; must be unique per running instance.
    pub instance_id: String,
    /// Pause between ticks.
    pub poll_interval: Duration,
    /// Maximum records per claim; a tick claims repeatedly until the backlog is drained.
    pub batch_size: usize,
    /// Upper bound for one channel send.
    pub delivery_timeout: Duration,
    /// How long a claim hides a record from other instances.
    pub lease: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "outbox-dispatcher".to_string(),
            instance_id: format!("dispatcher-{}", uuid::Uuid::now_v7()),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            batch_size: DEFAULT_BATCH_SIZE,
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            lease: Duration::from_millis(DEFAULT_LEASE_MS),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// Configuration of the relay process.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub database_url: String,
    pub redis_url: String,
    pub consumer_group: String,
    /// Name inside the consumer group; stable across restarts so the process
    /// walks its own pending entries again.
    pub consumer_name: String,
    /// Pending time after which any reader takes an unacknowledged entry over.
    pub claim_idle: Duration,
    pub dispatcher: DispatcherConfig,
    pub routes: DestinationRoutes,
}

impl RelayConfig {
    /// Load from the process environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DATABASE_URL` | required |
    /// | `REDIS_URL` | `redis://127.0.0.1:6379` |
    /// | `SAGA_CONSUMER_GROUP` | `wallethub-saga` |
    /// | `SAGA_CONSUMER_NAME` | `HOSTNAME`, else `wallethub-relay` |
    /// | `SAGA_CLAIM_IDLE_MS` | 60000 |
    /// | `OUTBOX_POLL_INTERVAL_MS` | 5000 |
    /// | `OUTBOX_BATCH_SIZE` | 100 |
    /// | `OUTBOX_DELIVERY_TIMEOUT_MS` | 3000 |
    /// | `OUTBOX_LEASE_MS` | 30000 |
    /// | `OUTBOX_INSTANCE_ID` | random |
    /// | `OUTBOX_DESTINATIONS` | built-in routes; `type=destination,...` overrides |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let redis_url = get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
        let consumer_group =
            get("SAGA_CONSUMER_GROUP").unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let consumer_name = get("SAGA_CONSUMER_NAME")
            .or_else(|| get("HOSTNAME"))
            .unwrap_or_else(|| DEFAULT_CONSUMER_NAME.to_string());
        let claim_idle = Duration::from_millis(parse_or(
            "SAGA_CLAIM_IDLE_MS",
            get("SAGA_CLAIM_IDLE_MS"),
            DEFAULT_CLAIM_IDLE_MS,
        )?);

        let mut dispatcher = DispatcherConfig::default()
            .with_poll_interval(Duration::from_millis(parse_or(
                "OUTBOX_POLL_INTERVAL_MS",
                get("OUTBOX_POLL_INTERVAL_MS"),
                DEFAULT_POLL_INTERVAL_MS,
            )?))
            .with_batch_size(parse_or(
                "OUTBOX_BATCH_SIZE",
                get("OUTBOX_BATCH_SIZE"),
                DEFAULT_BATCH_SIZE,
            )?)
            .with_delivery_timeout(Duration::from_millis(parse_or(
                "OUTBOX_DELIVERY_TIMEOUT_MS",
                get("OUTBOX_DELIVERY_TIMEOUT_MS"),
                DEFAULT_DELIVERY_TIMEOUT_MS,
            )?))
            .with_lease(Duration::from_millis(parse_or(
                "OUTBOX_LEASE_MS",
                get("OUTBOX_LEASE_MS"),
                DEFAULT_LEASE_MS,
            )?));
        if let Some(instance_id) = get("OUTBOX_INSTANCE_ID") {
            dispatcher = dispatcher.with_instance_id(instance_id);
        }

        let routes = match get("OUTBOX_DESTINATIONS") {
            Some(overrides) => DestinationRoutes::default()
                .merge_overrides(&overrides)
                .map_err(|reason| ConfigError::Invalid {
                    key: "OUTBOX_DESTINATIONS",
                    value: overrides.clone(),
                    reason,
                })?,
            None => DestinationRoutes::default(),
        };

        Ok(Self {
            database_url,
            redis_url,
            consumer_group,
            consumer_name,
            claim_idle,
            dispatcher,
            routes,
        })
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}
