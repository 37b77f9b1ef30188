//! Static event type → destination lookup.

use std::collections::HashMap;

use wallethub_events::{Event, FundsAdded, FundsTransferred, FundsWithdrawn, WalletCreated};

/// Maps outbox discriminators to channel destinations.
///
/// Destinations are looked up, never derived from the event type string, so
/// topics can be renamed without touching stored records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRoutes {
    routes: HashMap<String, String>,
}

impl DestinationRoutes {
    /// No routes at all.
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn with_route(mut self, event_type: impl Into<String>, destination: impl Into<String>) -> Self {
        self.routes.insert(event_type.into(), destination.into());
        self
    }

    pub fn destination_for(&self, event_type: &str) -> Option<&str> {
        self.routes.get(event_type).map(String::as_str)
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }

    /// `(event_type, destination)` pairs, sorted by event type.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        let mut pairs: Vec<_> = self
            .routes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        pairs.sort();
        pairs.into_iter()
    }

    /// Apply `event_type=destination,...` overrides on top of `self`.
    ///
    /// Blank segments are ignored; a segment without `=` or with an empty
    /// side is an error naming the segment.
    pub fn merge_overrides(mut self, overrides: &str) -> Result<Self, String> {
        for segment in overrides.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (event_type, destination) = segment
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .ok_or_else(|| format!("expected event_type=destination, got '{segment}'"))?;
            self.routes
                .insert(event_type.to_string(), destination.to_string());
        }
        Ok(self)
    }
}

impl Default for DestinationRoutes {
    fn default() -> Self {
        Self::empty()
            .with_route(WalletCreated::EVENT_TYPE, "wallet-created-topic")
            .with_route(FundsAdded::EVENT_TYPE, "funds-added-topic")
            .with_route(FundsWithdrawn::EVENT_TYPE, "funds-withdrawn-topic")
            .with_route(FundsTransferred::EVENT_TYPE, "funds-transferred-topic")
    }
}
