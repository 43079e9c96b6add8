//! Error types for the Tollgate engine.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Tollgate operations.
///
/// Quota exhaustion is deliberately absent: a rejected request is an
/// ordinary [`RateLimitResult`](crate::ratelimit::RateLimitResult), not a fault.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule failed authoring-time validation
    #[error("Invalid rule '{id}': {reason}")]
    InvalidRule { id: String, reason: String },

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    pub(crate) fn invalid_rule(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
