//! Error types for admission control.
//!
//! Running out of tokens is not an error: it is [`Withdrawal::Denied`](crate::Withdrawal)
//! and surfaces to callers as [`Admission::Reject`](crate::Admission).
use std::time::Duration;

/// Failure to reach the shared store or to run the withdrawal against it.
///
/// Every variant means the store is unavailable for this check. The coordinator turns
/// all of them into a bypass (or a reject, under [`FailureMode::Closed`](crate::FailureMode)).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The connection is not established, was refused, or dropped.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Underlying client error.
        reason: String,
    },
    /// The round trip did not finish in time.
    #[error("store call timed out after {timeout:?}")]
    Timeout {
        /// Limit that was exceeded.
        timeout: Duration,
    },
    /// The atomic withdrawal failed to execute.
    #[error("atomic withdrawal failed: {reason}")]
    Script {
        /// Error reported by the store.
        reason: String,
    },
    /// The store replied with something the withdrawal contract does not allow.
    #[error("malformed store reply: {reply}")]
    MalformedReply {
        /// Debug rendering of the reply.
        reply: String,
    },
}

impl StoreError {
    /// Build an [`StoreError::Unavailable`] from any displayable cause.
    pub fn unavailable(reason: impl ToString) -> Self {
        StoreError::Unavailable { reason: reason.to_string() }
    }

    /// Whether this error means the connection itself is gone.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::Timeout { .. })
    }
}

/// Invalid bucket configuration. Raised at construction and meant to abort startup.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Capacity must be finite and > 0.
    #[error("capacity must be finite and > 0 (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: f64,
    },
    /// Refill rate must be finite and > 0.
    #[error("refill rate must be finite and > 0 (got {provided})")]
    InvalidRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// Window size must be finite and > 0.
    #[error("window size must be finite and > 0 seconds (got {provided})")]
    InvalidWindow {
        /// Value provided by caller, in seconds.
        provided: f64,
    },
    /// Neither a refill rate nor a window size was supplied.
    #[error("either refillRate or windowSize must be supplied alongside capacity")]
    MissingRefill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::unavailable("connection refused");
        assert_eq!(err.to_string(), "store unavailable: connection refused");

        let err = StoreError::Timeout { timeout: Duration::from_millis(250) };
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn connection_failures_are_classified() {
        assert!(StoreError::unavailable("x").is_connection_failure());
        assert!(StoreError::Timeout { timeout: Duration::from_secs(1) }.is_connection_failure());
        assert!(!StoreError::Script { reason: "NOSCRIPT".into() }.is_connection_failure());
        assert!(!StoreError::MalformedReply { reply: "nil".into() }.is_connection_failure());
    }

    #[test]
    fn config_error_display_includes_value() {
        let err = ConfigError::InvalidCapacity { provided: -1.0 };
        assert!(err.to_string().contains("-1"));
        assert!(ConfigError::MissingRefill.to_string().contains("windowSize"));
    }
}
