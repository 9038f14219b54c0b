//! Bearer token acquisition and caching.
//!
//! An [`Authenticator`] knows how to obtain a fresh [`AccessToken`]. The
//! [`TokenProvider`] wraps one, caches the token until shortly before it
//! expires, and retries transient failures with backoff.
//!
//! # Example
//!
//! ```rust
//! use dartrelay_feed::auth::{StaticAuthenticator, TokenProvider};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let provider = TokenProvider::new(StaticAuthenticator::new("local-token"));
//! assert_eq!(provider.token().await.unwrap(), "local-token");
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::error::AuthError;

/// Tokens are refreshed once they are this close to expiry.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// Attempts per refresh before giving up.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// A bearer token and its expiry.
#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Instant,
}

impl AccessToken {
    /// Creates a token valid for `lifetime` from now.
    #[must_use]
    pub fn new(value: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + lifetime,
        }
    }

    /// Returns `true` if the token is still valid `margin` from now.
    #[must_use]
    pub fn is_fresh(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of bearer tokens.
pub trait Authenticator: Send + Sync + 'static {
    /// Obtains a new token.
    fn get_token(&self) -> impl Future<Output = Result<AccessToken, AuthError>> + Send;
}

/// Authenticator that always hands out the same token.
///
/// Useful against local vendors that do not check tokens.
#[derive(Clone)]
pub struct StaticAuthenticator {
    token: String,
}

impl StaticAuthenticator {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAuthenticator")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl Authenticator for StaticAuthenticator {
    async fn get_token(&self) -> Result<AccessToken, AuthError> {
        // Effectively never expires
        Ok(AccessToken::new(
            self.token.clone(),
            Duration::from_secs(365 * 24 * 60 * 60),
        ))
    }
}

/// Caching, retrying wrapper around an [`Authenticator`].
///
/// Concurrent callers share one refresh: the cache sits behind an async
/// mutex that is held across the authenticator call.
pub struct TokenProvider<A> {
    authenticator: A,
    cache: Mutex<Option<AccessToken>>,
    refresh_margin: Duration,
    retry_attempts: u32,
    retry_backoff: ReconnectPolicy,
}

impl<A: Authenticator> TokenProvider<A> {
    /// Creates a provider with the default margin and retry budget.
    #[must_use]
    pub fn new(authenticator: A) -> Self {
        Self {
            authenticator,
            cache: Mutex::new(None),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff: ReconnectPolicy::new(Duration::from_millis(250), Duration::from_secs(4)),
        }
    }

    /// Sets how long before expiry a token is refreshed (builder pattern).
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Sets the retry budget and backoff (builder pattern).
    ///
    /// `attempts` is clamped to at least 1.
    #[must_use]
    pub fn with_retry(mut self, attempts: u32, backoff: ReconnectPolicy) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    /// Returns a valid bearer token, refreshing it if needed.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] immediately, since retrying cannot help
    /// - [`AuthError::RetriesExhausted`] when every transient attempt failed
    pub async fn token(&self) -> Result<String, AuthError> {
        let mut cache = self.cache.lock().await;

        if let Some(token) = cache.as_ref() {
            if token.is_fresh(self.refresh_margin) {
                return Ok(token.value.clone());
            }
            debug!("Cached token is near expiry, refreshing");
        }

        let token = self.fetch_with_retry().await?;
        let value = token.value.clone();
        *cache = Some(token);
        Ok(value)
    }

    /// Drops the cached token so the next call fetches a new one.
    pub async fn invalidate(&self) {
        self.cache.lock().await.take();
    }

    async fn fetch_with_retry(&self) -> Result<AccessToken, AuthError> {
        let mut last_error = String::new();

        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                let delay = self.retry_backoff.delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying token request");
                tokio::time::sleep(delay).await;
            }

            match self.authenticator.get_token().await {
                Ok(token) => {
                    info!("Obtained access token");
                    return Ok(token);
                }
                Err(e) if !e.is_retryable() => {
                    warn!(error = %e, "Token request rejected");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.retry_attempts,
                        error = %e,
                        "Token request failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(AuthError::RetriesExhausted {
            attempts: self.retry_attempts,
            last_error,
        })
    }

    /// Spawns a task that keeps the cached token fresh.
    ///
    /// The task stops once every other `Arc` to the provider is dropped.
    pub fn spawn_refresh_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(provider) = weak.upgrade() else {
                    debug!("Token provider dropped, stopping refresh task");
                    break;
                };
                if let Err(e) = provider.token().await {
                    warn!(error = %e, "Background token refresh failed");
                }
            }
        })
    }
}

impl<A> fmt::Debug for TokenProvider<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("refresh_margin", &self.refresh_margin)
            .field("retry_attempts", &self.retry_attempts)
            .finish_non_exhaustive()
    }
}
