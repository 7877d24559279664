//! Common error types for Switchyard
//!
//! This module defines all error types used across the Switchyard system.
//! Caller-facing errors convert into a structured wire `Rejection` and an
//! HTTP status for the operations server.

use std::time::Duration;
use switchyard_proto::{Rejection, RejectionKind};
use thiserror::Error;

/// Main error type for Switchyard
#[derive(Error, Debug)]
pub enum SwitchyardError {
    /// Malformed configuration or descriptors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No ready backend satisfies the request
    #[error("No capacity: {message}")]
    Capacity {
        message: String,
        /// False when no backend on this fleet could ever serve the request
        retryable: bool,
    },

    /// Caller exceeded its admission quota
    #[error("Rate limited: {message} (retry after {retry_after:?})")]
    Quota {
        message: String,
        retry_after: Duration,
    },

    /// A selected backend failed mid-request
    #[error("Backend {backend_id} fault: {message}")]
    BackendFault { backend_id: String, message: String },

    /// Probe exceeded its deadline; absorbed by the health tracker
    #[error("Probe timed out: {0}")]
    ProbeTimeout(String),

    /// Request can not be interpreted
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend process control errors
    #[error("Process error: {0}")]
    Process(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwitchyardError {
    /// Structured rejection for the caller's transport.
    ///
    /// Backend faults and internal failures surface as `no_capacity` so the
    /// caller can tell "try again later" apart from "never here".
    pub fn rejection(&self) -> Rejection {
        match self {
            SwitchyardError::Quota { message, retry_after } => Rejection {
                kind: RejectionKind::RateLimited,
                message: message.clone(),
                retry_after_ms: Some(retry_after.as_millis() as u64),
                retryable: true,
            },
            SwitchyardError::Capacity { message, retryable } => Rejection {
                kind: RejectionKind::NoCapacity,
                message: message.clone(),
                retry_after_ms: None,
                retryable: *retryable,
            },
            SwitchyardError::InvalidRequest(msg) => Rejection {
                kind: RejectionKind::InvalidRequest,
                message: msg.clone(),
                retry_after_ms: None,
                retryable: false,
            },
            other => Rejection {
                kind: RejectionKind::NoCapacity,
                message: other.to_string(),
                retry_after_ms: None,
                retryable: true,
            },
        }
    }

    /// HTTP status code matching `rejection()`
    pub fn http_status(&self) -> u16 {
        match self {
            SwitchyardError::Quota { .. } => 429,
            SwitchyardError::InvalidRequest(_) => 400,
            SwitchyardError::Capacity { retryable: false, .. } => 422,
            SwitchyardError::BackendFault { .. } => 502,
            SwitchyardError::Timeout(_) => 504,
            SwitchyardError::Capacity { .. } | SwitchyardError::Connection(_) => 503,
            _ => 500,
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        self.rejection().retryable
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        SwitchyardError::Config(msg.into())
    }

    /// Create a transient capacity error
    pub fn no_capacity(msg: impl Into<String>) -> Self {
        SwitchyardError::Capacity {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a capacity error for requests no backend can ever serve
    pub fn unservable(msg: impl Into<String>) -> Self {
        SwitchyardError::Capacity {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a quota error
    pub fn quota(msg: impl Into<String>, retry_after: Duration) -> Self {
        SwitchyardError::Quota {
            message: msg.into(),
            retry_after,
        }
    }

    /// Create a backend fault
    pub fn backend_fault(backend_id: impl Into<String>, msg: impl Into<String>) -> Self {
        SwitchyardError::BackendFault {
            backend_id: backend_id.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        SwitchyardError::InvalidRequest(msg.into())
    }

    /// Create a process control error
    pub fn process(msg: impl Into<String>) -> Self {
        SwitchyardError::Process(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        SwitchyardError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        SwitchyardError::Internal(msg.into())
    }
}

/// Result type alias for Switchyard operations
pub type Result<T> = std::result::Result<T, SwitchyardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_rejection_carries_retry_after() {
        let err = SwitchyardError::quota("60 requests/min", Duration::from_millis(2500));
        let rejection = err.rejection();

        assert_eq!(rejection.kind, RejectionKind::RateLimited);
        assert_eq!(rejection.retry_after_ms, Some(2500));
        assert!(rejection.retryable);
        assert_eq!(err.http_status(), 429);
    }

    #[test]
    fn test_capacity_distinguishes_never_from_later() {
        let later = SwitchyardError::no_capacity("all backends down");
        let never = SwitchyardError::unservable("context exceeds every backend");

        assert!(later.is_retryable());
        assert!(!never.is_retryable());
        assert_eq!(later.rejection().kind, RejectionKind::NoCapacity);
        assert_eq!(never.rejection().kind, RejectionKind::NoCapacity);
        assert_ne!(later.http_status(), never.http_status());
    }

    #[test]
    fn test_backend_fault_maps_to_no_capacity() {
        let err = SwitchyardError::backend_fault("glm", "connection reset");
        assert_eq!(err.rejection().kind, RejectionKind::NoCapacity);
        assert_eq!(err.http_status(), 502);
    }
}
