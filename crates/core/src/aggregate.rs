//! Aggregate root trait for domain models.

/// Aggregate root marker + minimal interface.
///
/// This is intentionally small so domain modules decide how they model state
/// transitions without bringing in any infrastructure concerns.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// Stores use it for optimistic concurrency: a save is only accepted when
    /// the persisted version still matches the version the change was based on.
    fn version(&self) -> u64;
}
