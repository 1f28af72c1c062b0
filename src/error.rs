//! Error types for WS-Management operations.
//!
//! This module defines the error type used throughout the crate. The
//! variants distinguish the conditions callers react to differently:
//! authentication rejections and timeouts are remembered per host and stop
//! further traffic, transient transport faults are worth one retry, and
//! state-machine misuse surfaces as [`WinRmError::IllegalState`] rather
//! than a panic.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for WS-Management operations.
pub type WinRmResult<T> = std::result::Result<T, WinRmError>;

/// The error type for WS-Management operations.
#[derive(Error, Debug)]
pub enum WinRmError {
    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// The host rejected our credentials (HTTP 401). Remembered for the
    /// lifetime of the [`HostRegistry`](crate::registry::HostRegistry);
    /// later requests to the same host fail without network traffic.
    #[error("Authentication failed for host '{host}'")]
    Unauthorized {
        /// Host that rejected the credentials
        host: String,
    },

    /// A request to the host timed out. Also remembered per host.
    #[error("Request to host '{host}' timed out after {after:?}")]
    Timeout {
        /// Host that failed to answer in time
        host: String,
        /// Request timeout that elapsed
        after: Duration,
    },

    /// Failed to reach the host at the transport level (DNS, TCP, TLS).
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The host answered with a non-success HTTP status. `reason` carries
    /// the SOAP fault text when the body contained one.
    #[error("Request failed with status {status}: {reason}")]
    RequestError {
        /// HTTP status code of the response
        status: u16,
        /// Fault reason extracted from the body, or a generic description
        reason: String,
        /// Numeric WSManFault code from the body, when one was present
        code: Option<u64>,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// The remote shell backing a running command no longer exists on the
    /// server. Recoverable by recreating shell and command.
    #[error("Remote shell invalidated: {0}")]
    ShellInvalidated(String),

    /// The response body could not be parsed as the expected SOAP payload.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    // ========================================================================
    // Caller Errors
    // ========================================================================
    /// Caller-supplied input is invalid (empty query, unquotable counter
    /// path, incomplete configuration). Never retried.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// An operation was invoked in a state that does not permit it.
    #[error("Operation '{operation}' is not legal in state {state}")]
    IllegalState {
        /// State the component was in
        state: String,
        /// Operation that was rejected
        operation: String,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// A long-running session hit its consecutive-failure or empty-receive
    /// threshold and was forced back to the stopped state.
    #[error("Session for host '{host}' exhausted after {failures} consecutive failures: {cause}")]
    SessionExhausted {
        /// Host the session was collecting from
        host: String,
        /// Number of consecutive failed cycles
        failures: u32,
        /// Description of the final failure
        cause: String,
    },
}

impl WinRmError {
    /// Creates an illegal-state error from the current state and the
    /// operation that was rejected.
    pub fn illegal_state(state: impl ToString, operation: impl Into<String>) -> Self {
        Self::IllegalState {
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    /// Returns true if a single retry against the same host is worthwhile.
    ///
    /// Authentication failures and invalid caller input are permanent;
    /// transport hiccups, invalidated shells, and the server's own
    /// internal-error responses are worth one more attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            WinRmError::Timeout { .. }
            | WinRmError::ConnectionFailed(_)
            | WinRmError::ShellInvalidated(_) => true,
            WinRmError::RequestError { reason, .. } => {
                let reason = reason.to_ascii_lowercase();
                reason.contains("internal error") || reason.contains("unexpected response")
            }
            _ => false,
        }
    }

    /// Returns true if this error signals the invalidated-shell condition
    /// the shell client recovers from by recreating shell and command.
    pub fn is_shell_invalidated(&self) -> bool {
        matches!(self, WinRmError::ShellInvalidated(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(WinRmError::ConnectionFailed("connection refused".into()).is_transient());
        assert!(WinRmError::Timeout {
            host: "srv1".into(),
            after: Duration::from_secs(60),
        }
        .is_transient());
        assert!(WinRmError::ShellInvalidated("shell gone".into()).is_transient());
        assert!(WinRmError::RequestError {
            status: 500,
            reason: "The WS-Management service cannot process the request. Internal error.".into(),
            code: None,
        }
        .is_transient());

        assert!(!WinRmError::Unauthorized { host: "srv1".into() }.is_transient());
        assert!(!WinRmError::InvalidParameter("empty query".into()).is_transient());
        assert!(!WinRmError::RequestError {
            status: 500,
            reason: "The parameter is incorrect.".into(),
            code: None,
        }
        .is_transient());
    }

    #[test]
    fn test_illegal_state_display() {
        let err = WinRmError::illegal_state("STARTED", "start");
        assert_eq!(
            err.to_string(),
            "Operation 'start' is not legal in state STARTED"
        );
    }
}
