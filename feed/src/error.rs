//! Error types for the feed client.
//!
//! The taxonomy follows how far each failure is allowed to travel:
//!
//! - [`AuthError`] - token acquisition failed; fatal at startup, retried at runtime
//! - [`ConnectError`] - the vendor connection could not be (re)established
//! - [`ProtocolError`] - an inbound frame was malformed; logged and dropped
//! - [`SendError`] - an outbound command could not be written
//! - [`FeedError`] - why the relay task stopped for good

use std::time::Duration;

use thiserror::Error;

/// Errors raised while obtaining a bearer token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The identity provider rejected the configured credentials.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The identity provider could not be reached.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    /// The identity provider answered with something we could not parse.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// Every attempt within the retry budget failed.
    #[error("all {attempts} token attempts failed: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last error encountered.
        last_error: String,
    },
}

impl AuthError {
    /// Returns `true` if retrying the same request could succeed.
    ///
    /// Rejected credentials will be rejected again, so they are not retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::InvalidResponse(_))
    }
}

/// Errors raised while opening the vendor WebSocket.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// No bearer token could be obtained for the handshake.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The endpoint URL could not be turned into a handshake request.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    /// The server refused the upgrade with an HTTP status.
    #[error("upgrade rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status code returned instead of `101 Switching Protocols`.
        status: u16,
        /// Human readable reason.
        message: String,
    },

    /// TCP, TLS or WebSocket handshake failure.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The handshake did not finish in time.
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// A finite reconnect budget was used up.
    #[error("gave up after {attempts} connection attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last error encountered.
        last_error: String,
    },
}

/// A frame from the vendor that could not be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not have the expected shape.
    #[error("invalid JSON frame: {0}")]
    InvalidJson(String),

    /// A required field was absent.
    #[error("frame is missing required field '{0}'")]
    MissingField(&'static str),

    /// The frame exceeded the maximum accepted size.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    Oversized {
        /// Size of the rejected frame.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// An outbound command could not be delivered.
#[derive(Error, Debug)]
pub enum SendError {
    /// There is no open transport to write to.
    #[error("not connected")]
    NotConnected,

    /// The command could not be serialized.
    #[error("failed to serialize command: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The write failed; the transport has been dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// The write did not finish in time; the transport has been dropped.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Top-level error for the relay task.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Connection failure that exhausted the reconnect budget.
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_displays_correctly() {
        let err = AuthError::InvalidCredentials("invalid_grant".to_string());
        assert_eq!(err.to_string(), "invalid credentials: invalid_grant");

        let err = AuthError::RetriesExhausted {
            attempts: 3,
            last_error: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "all 3 token attempts failed: timeout");
    }

    #[test]
    fn only_transient_auth_errors_are_retryable() {
        assert!(AuthError::Unavailable("down".into()).is_retryable());
        assert!(AuthError::InvalidResponse("html".into()).is_retryable());
        assert!(!AuthError::InvalidCredentials("nope".into()).is_retryable());
        assert!(!AuthError::RetriesExhausted {
            attempts: 1,
            last_error: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn connect_error_wraps_auth_error() {
        let err: ConnectError = AuthError::Unavailable("dns".into()).into();
        assert!(matches!(err, ConnectError::Auth(_)));
        assert_eq!(
            err.to_string(),
            "authentication failed: identity provider unavailable: dns"
        );
    }

    #[test]
    fn protocol_error_displays_correctly() {
        assert_eq!(
            ProtocolError::MissingField("channel").to_string(),
            "frame is missing required field 'channel'"
        );
        assert_eq!(
            ProtocolError::Oversized { size: 10, limit: 5 }.to_string(),
            "frame of 10 bytes exceeds limit of 5 bytes"
        );
    }

    #[test]
    fn feed_error_is_transparent() {
        let err: FeedError = ConnectError::Timeout(Duration::from_secs(10)).into();
        assert_eq!(err.to_string(), "connection attempt timed out after 10s");
    }

    #[test]
    fn send_timeout_displays_limit() {
        let err = SendError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "write timed out after 250ms");
    }
}
