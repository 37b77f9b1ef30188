//! Domain error model.

use thiserror::Error;

/// A wallet operation or value was refused before anything was persisted.
///
/// Storage and transport failures have their own error types in `infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input: non-positive amount, self-transfer, unknown state name.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The wallet would break a rule it always holds (no overdraft, no overflow).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An id did not parse, or a correlation id was blank.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
