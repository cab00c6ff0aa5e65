//! Error types for the PowerFlex reconciler
//!
//! Every remote failure carries the operation name and the target identifier
//! so a caller can diagnose it without re-running the operation.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the reconciler
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Reference Resolution Errors
    // =========================================================================
    #[error("No {kind} matches reference {reference}")]
    ReferenceNotFound { kind: String, reference: String },

    #[error("Reference {reference} is ambiguous: {matches} {kind} entities match")]
    ReferenceAmbiguous {
        kind: String,
        reference: String,
        matches: usize,
    },

    // =========================================================================
    // Remote API Errors
    // =========================================================================
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("{operation} on {target} rejected (status {status}): {message}")]
    RemoteRejected {
        operation: String,
        target: String,
        status: u16,
        message: String,
    },

    #[error("{operation} on {target} failed in transport: {reason}")]
    TransportFailure {
        operation: String,
        target: String,
        reason: String,
    },

    #[error("Update of {kind} {id} partially failed: {}", .failures.join("; "))]
    PartialUpdate {
        kind: String,
        id: String,
        /// Mutations that did reach the remote system
        applied: Vec<String>,
        failures: Vec<String>,
    },

    // =========================================================================
    // Installer Errors
    // =========================================================================
    #[error("Installer timed out in phase {phase} after {polls} running polls")]
    InstallerTimeout { phase: String, polls: u32 },

    #[error("Installer failed in phase {phase}: {message}")]
    Installer { phase: String, message: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action a caller should take for an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Safe to retry the same call with backoff
    RetryWithBackoff,
    /// Retry after the remote side has had time to settle
    RetryAfter(Duration),
    /// Do not retry; the request or configuration must change
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::TransportFailure { .. } => ErrorAction::RetryWithBackoff,

            // The gateway queue is reset before this is returned
            Error::InstallerTimeout { .. } => ErrorAction::RetryAfter(Duration::from_secs(300)),

            _ => ErrorAction::NoRetry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransportFailure { .. })
    }

    /// Check if this error reports a missing remote entity
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub(crate) fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}

/// Result type alias for the reconciler
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::TransportFailure {
            operation: "get_volume".into(),
            target: "Volume::1".into(),
            reason: "connection reset".into(),
        };
        assert_eq!(err.action(), ErrorAction::RetryWithBackoff);

        let err = Error::RemoteRejected {
            operation: "set_volume_name".into(),
            target: "Volume::1".into(),
            status: 500,
            message: "Volume name already in use".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRetry);

        let err = Error::InstallerTimeout {
            phase: "install".into(),
            polls: 5,
        };
        assert_eq!(
            err.action(),
            ErrorAction::RetryAfter(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::TransportFailure {
            operation: "login".into(),
            target: "https://gw".into(),
            reason: "timeout".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let ambiguous = Error::ReferenceAmbiguous {
            kind: "Sdc".into(),
            reference: "name=host-1".into(),
            matches: 2,
        };
        assert!(!ambiguous.is_retryable());
        assert!(!ambiguous.is_transient());
    }

    #[test]
    fn test_rejected_message_is_verbatim() {
        let err = Error::RemoteRejected {
            operation: "create_volume".into(),
            target: "StoragePool::p1".into(),
            status: 500,
            message: "Not enough capacity".into(),
        };
        assert!(err.to_string().ends_with("Not enough capacity"));
    }

    #[test]
    fn test_partial_update_lists_failures() {
        let err = Error::PartialUpdate {
            kind: "Volume".into(),
            id: "v1".into(),
            applied: vec!["set_volume_rm_cache".into()],
            failures: vec!["rename: denied".into(), "resize: denied".into()],
        };
        assert_eq!(
            err.to_string(),
            "Update of Volume v1 partially failed: rename: denied; resize: denied"
        );
    }
}
