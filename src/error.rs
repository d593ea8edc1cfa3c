use std::time::Duration;

use thiserror::Error;

use crate::auth::SessionState;

/// A type alias for `Result<T, CTraderError>`.
pub type Result<T, E = CTraderError> = std::result::Result<T, E>;

/// The main error type for the cTrader connector.
///
/// This enum represents all possible errors that can surface from a session:
/// request-level failures (timeout, cancellation, server rejections),
/// connection-level failures (transport loss, protocol violations), and
/// configuration problems.
///
/// # Examples
///
/// ```no_run
/// use ctrader_connector_rs::error::{CTraderError, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Success!"),
///         Err(CTraderError::Remote { code, description, .. }) => {
///             println!("Server rejected the request: {} ({})", description, code);
///         }
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum CTraderError {
    /// The session is not in the `Ready` state and the call cannot proceed.
    #[error("session not ready (state: {state})")]
    NotReady {
        /// The session state at the time of the call
        state: SessionState,
    },

    /// The request deadline elapsed without a matching response.
    #[error("request timed out after {timeout:?}")]
    Timeout {
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// The caller cancelled the request before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// The underlying connection closed or errored while the request was
    /// in flight.
    #[error("transport lost: {reason}")]
    TransportLost {
        /// Why the transport was considered lost
        reason: String,
    },

    /// The server answered with its generic error message.
    #[error("server error {code}: {description}")]
    Remote {
        /// The server-side error code (e.g. `CH_CLIENT_AUTH_FAILURE`)
        code: String,
        /// A human-readable description from the server
        description: String,
        /// Scheduled maintenance end, as a Unix millisecond timestamp,
        /// when the server provides one
        maintenance_end: Option<i64>,
    },

    /// A framing or envelope violation. Fatal for the current connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame exceeded the configured size limit, in either direction.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Observed frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Authentication was rejected with a non-retriable error. The session
    /// moves to `Fatal` and refuses further requests with this error.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The TCP/TLS connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Represents errors during I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The outer envelope could not be decoded.
    #[error("envelope decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl CTraderError {
    pub(crate) fn transport_lost(reason: impl Into<String>) -> Self {
        CTraderError::TransportLost {
            reason: reason.into(),
        }
    }

    /// Whether this error represents an authentication rejection that no
    /// amount of retrying will fix (bad credentials, permanently rejected
    /// token).
    pub fn is_fatal_auth(&self) -> bool {
        match self {
            CTraderError::AuthFailed(_) => true,
            CTraderError::Remote { code, .. } => is_non_retriable_auth_code(code),
            _ => false,
        }
    }
}

/// Error codes the server uses for credential rejections that must not be
/// retried.
pub(crate) fn is_non_retriable_auth_code(code: &str) -> bool {
    matches!(
        code,
        "CH_CLIENT_AUTH_FAILURE"
            | "INVALID_CLIENT_ID"
            | "CH_ACCESS_TOKEN_INVALID"
            | "CH_CTID_TRADER_ACCOUNT_NOT_FOUND"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = CTraderError::Remote {
            code: "CH_CLIENT_AUTH_FAILURE".to_string(),
            description: "Invalid client credentials".to_string(),
            maintenance_end: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("CH_CLIENT_AUTH_FAILURE"));
        assert!(msg.contains("Invalid client credentials"));
    }

    #[test]
    fn test_fatal_auth_classification() {
        let fatal = CTraderError::Remote {
            code: "CH_CLIENT_AUTH_FAILURE".to_string(),
            description: "bad credentials".to_string(),
            maintenance_end: None,
        };
        assert!(fatal.is_fatal_auth());

        let transient = CTraderError::Remote {
            code: "CH_SERVER_NOT_REACHABLE".to_string(),
            description: "try later".to_string(),
            maintenance_end: None,
        };
        assert!(!transient.is_fatal_auth());

        assert!(!CTraderError::Cancelled.is_fatal_auth());
    }
}
