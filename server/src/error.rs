//! Error types for the dartrelay server.
//!
//! # Error Types
//!
//! - [`ConfigError`] - Configuration problems, re-exported from [`crate::config`]
//! - [`ServerError`] - Top-level errors that end the process
//!
//! Errors inside the feed (reconnects, malformed frames, failed sends) are
//! handled by the relay and never reach this level. Only the failures listed
//! here stop the server.

use std::error::Error;
use std::fmt;
use std::io;
use std::net::SocketAddr;

use dartrelay_feed::{AuthError, FeedError};

pub use crate::config::ConfigError;

/// Top-level error type for the dartrelay server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration could not be loaded.
    Config(ConfigError),

    /// The initial token could not be obtained.
    Auth(AuthError),

    /// The relay stopped for good, usually because the reconnect budget ran out.
    Feed(FeedError),

    /// The HTTP listener could not be bound.
    Bind {
        /// The address that was requested.
        addr: SocketAddr,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The HTTP server failed while running.
    Serve(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(err) => write!(f, "authentication failed: {err}"),
            Self::Feed(err) => write!(f, "feed error: {err}"),
            Self::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
            Self::Serve(err) => write!(f, "server error: {err}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Auth(err) => Some(err),
            Self::Feed(err) => Some(err),
            Self::Bind { source, .. } => Some(source),
            Self::Serve(err) => Some(err),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<FeedError> for ServerError {
    fn from(err: FeedError) -> Self {
        Self::Feed(err)
    }
}

impl ServerError {
    /// Creates a bind error for `addr`.
    #[must_use]
    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { addr, source }
    }

    /// Returns `true` if the operator has to fix something before a restart helps.
    #[must_use]
    pub fn is_operator_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Auth(AuthError::InvalidCredentials(_)) | Self::Bind { .. }
        )
    }
}
