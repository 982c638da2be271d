//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Covers deterministic failures only: bad configuration values, malformed
/// identifiers, and persisted values that no longer decode. Storage and
/// secondary-store failures belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. a retry policy with a zero cap).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A counter name is not part of the target's delta schema.
    #[error("unknown counter '{name}' for target kind '{target_kind}'")]
    UnknownCounter {
        target_kind: &'static str,
        name: String,
    },

    /// A persisted task status could not be decoded.
    #[error("unknown task status: {0}")]
    UnknownStatus(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_counter(target_kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnknownCounter {
            target_kind,
            name: name.into(),
        }
    }
}
