/// A domain-agnostic event payload.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - identified by a **stable type name** that doubles as the outbox discriminator
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event type identifier (e.g. "WalletCreated").
    ///
    /// Persisted in the outbox `event_type` column and used to resolve the
    /// delivery destination, so renaming it is a schema change.
    const EVENT_TYPE: &'static str;

    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }
}
