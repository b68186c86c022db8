//! Errors reported by coordination store backends.

use thiserror::Error;

use crate::kv::LeaseId;
use crate::kv::Revision;

/// Errors from a [`CoordinationStore`](crate::CoordinationStore).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("connection failed: {reason}")]
    Connection { reason: String },
    /// The store did not answer in time.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    /// The lease was revoked, expired or never existed.
    #[error("lease {lease_id:x} not found")]
    LeaseNotFound { lease_id: LeaseId },
    /// The requested revision was compacted away.
    #[error("revision {revision} has been compacted")]
    Compacted { revision: Revision },
    /// The request was rejected as malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    /// Any other failure.
    #[error("operation failed: {reason}")]
    Failed { reason: String },
}

impl StoreError {
    /// True for failures that may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection { .. } | StoreError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_display() {
        let err = StoreError::Connection {
            reason: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "connection failed: refused");
    }

    #[test]
    fn lease_not_found_display_is_hex() {
        let err = StoreError::LeaseNotFound { lease_id: 255 };
        assert_eq!(err.to_string(), "lease ff not found");
    }

    #[test]
    fn only_transport_failures_are_transient() {
        assert!(StoreError::Timeout { duration_ms: 10 }.is_transient());
        assert!(
            StoreError::Connection {
                reason: "reset".to_string()
            }
            .is_transient()
        );
        assert!(!StoreError::Compacted { revision: 3 }.is_transient());
        assert!(
            !StoreError::InvalidRequest {
                reason: "empty key".to_string()
            }
            .is_transient()
        );
    }
}
