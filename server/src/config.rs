//! Server configuration module.
//!
//! Parses configuration from environment variables for the dartrelay server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `AUTODARTS_USERNAME` | Yes | - | Autodarts account name |
//! | `AUTODARTS_PASSWORD` | Yes | - | Autodarts account password |
//! | `AUTODARTS_CLIENT_ID` | Yes | - | OpenID client id |
//! | `AUTODARTS_CLIENT_SECRET` | Yes | - | OpenID client secret |
//! | `AUTODARTS_BOARD_ID` | Yes | - | Board whose matches are relayed |
//! | `AUTODARTS_WEBSOCKET_URL` | No | `wss://api.autodarts.io/ms/v0/subscribe` | Vendor subscription endpoint |
//! | `AUTODARTS_TOKEN_URL` | No | Autodarts Keycloak token endpoint | Where tokens are obtained |
//! | `HOST` | No | `0.0.0.0` | HTTP listen address |
//! | `PORT` | No | 8080 | HTTP listen port |
//! | `RELAY_RECONNECT_BASE_MS` | No | 500 | First reconnect delay ceiling |
//! | `RELAY_RECONNECT_MAX_MS` | No | 30000 | Largest reconnect delay |
//! | `RELAY_RECONNECT_MAX_ATTEMPTS` | No | unbounded | Consecutive failures before giving up |
//! | `RELAY_MATCH_IDLE_TIMEOUT_SECS` | No | 1800 | Abandon a silent match; 0 disables |
//! | `RELAY_KEEPALIVE_SECS` | No | 30 | Idle time before a ping; 0 disables |
//! | `RELAY_PONG_TIMEOUT_SECS` | No | 10 | Wait for a reply to a ping before reconnecting; 0 disables |

use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use dartrelay_feed::{Credentials, ReconnectPolicy};
use thiserror::Error;
use zeroize::Zeroizing;

/// Default vendor subscription endpoint.
pub const DEFAULT_WEBSOCKET_URL: &str = "wss://api.autodarts.io/ms/v0/subscribe";

/// Default token endpoint.
pub const DEFAULT_TOKEN_URL: &str =
    "https://login.autodarts.io/realms/autodarts/protocol/openid-connect/token";

/// Default HTTP listen address.
const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

const DEFAULT_RECONNECT_BASE_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_MATCH_IDLE_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_KEEPALIVE_SECS: u64 = 30;
const DEFAULT_PONG_TIMEOUT_SECS: u64 = 10;

/// Every variable that must be set, in the order they are checked.
pub const REQUIRED_VARS: [&str; 5] = [
    "AUTODARTS_USERNAME",
    "AUTODARTS_PASSWORD",
    "AUTODARTS_CLIENT_ID",
    "AUTODARTS_CLIENT_SECRET",
    "AUTODARTS_BOARD_ID",
];

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Autodarts account name.
    pub username: String,

    /// Autodarts account password.
    pub password: Zeroizing<String>,

    /// OpenID client id.
    pub client_id: String,

    /// OpenID client secret.
    pub client_secret: Zeroizing<String>,

    /// Board whose matches are relayed.
    pub board_id: String,

    /// Vendor subscription endpoint (`ws://` or `wss://`).
    pub websocket_url: String,

    /// OpenID token endpoint.
    pub token_url: String,

    /// HTTP listen address.
    pub host: IpAddr,

    /// HTTP server port.
    pub port: u16,

    /// First reconnect delay ceiling.
    pub reconnect_base: Duration,

    /// Largest reconnect delay.
    pub reconnect_max: Duration,

    /// Consecutive failed connects before the relay gives up; `None` retries forever.
    pub reconnect_max_attempts: Option<u32>,

    /// Silence after which a match is abandoned; zero disables the check.
    pub match_idle_timeout: Duration,

    /// Idle time before a keepalive ping; `None` disables pings.
    pub keepalive: Option<Duration>,

    /// How long a ping may go unanswered; `None` never gives up.
    pub pong_timeout: Option<Duration>,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - A required environment variable is missing or empty
    /// - An environment variable has invalid format
    /// - Port number is not a valid u16
    /// - The endpoints or reconnect bounds are inconsistent
    ///
    /// # Example
    ///
    /// ```no_run
    /// use dartrelay_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Relaying board {} on {}", config.board_id, config.bind_addr());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            username: required("AUTODARTS_USERNAME")?,
            password: Zeroizing::new(required("AUTODARTS_PASSWORD")?),
            client_id: required("AUTODARTS_CLIENT_ID")?,
            client_secret: Zeroizing::new(required("AUTODARTS_CLIENT_SECRET")?),
            board_id: required("AUTODARTS_BOARD_ID")?,
            websocket_url: optional("AUTODARTS_WEBSOCKET_URL")
                .unwrap_or_else(|| DEFAULT_WEBSOCKET_URL.to_string()),
            token_url: optional("AUTODARTS_TOKEN_URL")
                .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            host: parse_host()?,
            port: parse_port()?,
            reconnect_base: Duration::from_millis(parse_u64_env(
                "RELAY_RECONNECT_BASE_MS",
                DEFAULT_RECONNECT_BASE_MS,
            )?),
            reconnect_max: Duration::from_millis(parse_u64_env(
                "RELAY_RECONNECT_MAX_MS",
                DEFAULT_RECONNECT_MAX_MS,
            )?),
            reconnect_max_attempts: parse_max_attempts()?,
            match_idle_timeout: Duration::from_secs(parse_u64_env(
                "RELAY_MATCH_IDLE_TIMEOUT_SECS",
                DEFAULT_MATCH_IDLE_TIMEOUT_SECS,
            )?),
            keepalive: parse_optional_secs("RELAY_KEEPALIVE_SECS", DEFAULT_KEEPALIVE_SECS)?,
            pong_timeout: parse_optional_secs("RELAY_PONG_TIMEOUT_SECS", DEFAULT_PONG_TIMEOUT_SECS)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Ensures the endpoints use the expected schemes and the reconnect
    /// delays form a usable window.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.websocket_url.starts_with("ws://") || self.websocket_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidFormat {
                var: "AUTODARTS_WEBSOCKET_URL".to_string(),
                message: format!("expected a ws:// or wss:// URL, got '{}'", self.websocket_url),
            });
        }

        if !(self.token_url.starts_with("http://") || self.token_url.starts_with("https://")) {
            return Err(ConfigError::InvalidFormat {
                var: "AUTODARTS_TOKEN_URL".to_string(),
                message: format!("expected an http:// or https:// URL, got '{}'", self.token_url),
            });
        }

        if self.reconnect_base.is_zero() {
            return Err(ConfigError::ValidationError(
                "RELAY_RECONNECT_BASE_MS must be greater than 0".to_string(),
            ));
        }

        if self.reconnect_base > self.reconnect_max {
            return Err(ConfigError::ValidationError(format!(
                "RELAY_RECONNECT_BASE_MS ({}) exceeds RELAY_RECONNECT_MAX_MS ({})",
                self.reconnect_base.as_millis(),
                self.reconnect_max.as_millis()
            )));
        }

        if self.reconnect_max_attempts == Some(0) {
            return Err(ConfigError::ValidationError(
                "RELAY_RECONNECT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// The HTTP listen address.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// The account credentials for the token endpoint.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }

    /// The reconnect policy for the feed connection.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let policy = ReconnectPolicy::new(self.reconnect_base, self.reconnect_max);
        match self.reconnect_max_attempts {
            Some(max) => policy.with_max_attempts(max),
            None => policy,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("board_id", &self.board_id)
            .field("websocket_url", &self.websocket_url)
            .field("token_url", &self.token_url)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("reconnect_base", &self.reconnect_base)
            .field("reconnect_max", &self.reconnect_max)
            .field("reconnect_max_attempts", &self.reconnect_max_attempts)
            .field("match_idle_timeout", &self.match_idle_timeout)
            .field("keepalive", &self.keepalive)
            .field("pong_timeout", &self.pong_timeout)
            .finish()
    }
}

/// Read a duration in seconds where zero means "disabled".
fn parse_optional_secs(name: &str, default: u64) -> Result<Option<Duration>, ConfigError> {
    match parse_u64_env(name, default)? {
        0 => Ok(None),
        secs => Ok(Some(Duration::from_secs(secs))),
    }
}

/// Read a required variable. Empty values count as missing.
fn required(name: &str) -> Result<String, ConfigError> {
    optional(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

/// Read an optional variable, treating empty values as unset.
fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse the HOST environment variable.
fn parse_host() -> Result<IpAddr, ConfigError> {
    match optional("HOST") {
        Some(host) => host.trim().parse().map_err(|e| ConfigError::InvalidFormat {
            var: "HOST".to_string(),
            message: format!("'{host}' is not an IP address: {e}"),
        }),
        None => Ok(DEFAULT_HOST),
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a non-negative integer variable, falling back to `default`.
fn parse_u64_env(name: &str, default: u64) -> Result<u64, ConfigError> {
    match optional(name) {
        Some(value) => value.trim().parse().map_err(|e| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("expected a non-negative integer, got '{value}': {e}"),
        }),
        None => Ok(default),
    }
}

/// Parse RELAY_RECONNECT_MAX_ATTEMPTS; unset means unbounded.
fn parse_max_attempts() -> Result<Option<u32>, ConfigError> {
    let Some(value) = optional("RELAY_RECONNECT_MAX_ATTEMPTS") else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e| ConfigError::InvalidFormat {
            var: "RELAY_RECONNECT_MAX_ATTEMPTS".to_string(),
            message: format!("expected a positive integer, got '{value}': {e}"),
        })
}
