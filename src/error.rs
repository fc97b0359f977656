//! Error types for keywait.
//!
//! All errors are strongly typed using thiserror. Caller misuse surfaces as
//! [`ValidationError`], bounded waits that expire surface as
//! [`ExecutionError::Timeout`], and broken internal invariants surface as
//! [`CorrelatorError::Internal`].

use thiserror::Error;

use crate::transport::SubscriptionId;

/// Argument errors raised at the point of misuse.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Malformed key '{key}': {reason}")]
    MalformedKey {
        key: String,
        reason: String,
    },

    #[error("Invalid state: {reason}")]
    InvalidState {
        reason: String,
    },
}

/// Errors raised while a wait or a monitor is running.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Wait timed out after {duration_ms}ms; outstanding keys: {}", outstanding.join(", "))]
    Timeout {
        duration_ms: u64,
        outstanding: Vec<String>,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Unexpected payload: {reason}")]
    UnexpectedPayload {
        reason: String,
    },
}

/// Errors reported by the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Subscribe failed for {id}: {message}")]
    SubscribeFailed {
        id: SubscriptionId,
        message: String,
    },

    #[error("Unsubscribe failed for {id}: {message}")]
    UnsubscribeFailed {
        id: SubscriptionId,
        message: String,
    },
}

/// Top-level error type for keywait.
#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal inconsistency: {message}")]
    Internal {
        message: String,
    },
}

impl CorrelatorError {
    /// Creates an internal inconsistency error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for a missing required argument.
    #[must_use]
    pub fn missing(field: &str) -> Self {
        Self::Validation(ValidationError::MissingField {
            field: field.to_string(),
        })
    }

    /// Shorthand for a key that does not decompose into coordinates.
    #[must_use]
    pub fn malformed_key(key: &str, reason: impl Into<String>) -> Self {
        Self::Validation(ValidationError::MalformedKey {
            key: key.to_string(),
            reason: reason.into(),
        })
    }

    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Timeout { .. }))
    }

    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Keys that were still outstanding when a wait timed out.
    #[must_use]
    pub fn outstanding(&self) -> Option<&[String]> {
        match self {
            Self::Execution(ExecutionError::Timeout { outstanding, .. }) => Some(outstanding),
            _ => None,
        }
    }

    /// Returns true if retrying the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
            Self::Transport(_) => true,
        }
    }
}

/// Result type alias for keywait operations.
pub type CorrResult<T> = Result<T, CorrelatorError>;
