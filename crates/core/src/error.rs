//! Errors raised by the domain types themselves.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Failures a domain type detects on its own, with no store or collaborator
/// involved. Workflow and stock rules wrap this in their own enums.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// An aggregate was asked to enter a state it never allows.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An id string did not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An `ExpectedVersion` check failed.
    #[error("version conflict: {0}")]
    Conflict(String),
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

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
