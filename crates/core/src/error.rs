//! Domain error model.

use thiserror::Error;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation of inputs coming from
/// the Places API, the HTTP surface or the queue). Infrastructure concerns belong
/// in `eatsavvy-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed open-hours or phone number).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty place id).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A queue payload could not be understood.
    #[error("unsupported payload: {0}")]
    UnsupportedPayload(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unsupported_payload(msg: impl Into<String>) -> Self {
        Self::UnsupportedPayload(msg.into())
    }
}
