//! OpenID Connect token client for the Autodarts identity provider.
//!
//! Autodarts runs Keycloak. Tokens are obtained with the resource-owner
//! password grant; while Keycloak has also issued a refresh token that has
//! not expired, the cheaper `refresh_token` grant is tried first.
//!
//! | Outcome | Error |
//! |---------|-------|
//! | HTTP 400 / 401 | [`AuthError::InvalidCredentials`] |
//! | timeout, connect or transport failure | [`AuthError::Unavailable`] |
//! | other status, unparsable body | [`AuthError::InvalidResponse`] |

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::auth::{AccessToken, Authenticator};
use crate::error::AuthError;

/// Timeout for token endpoint requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Account and client credentials for the password grant.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Zeroizing<String>,
    pub client_id: String,
    pub client_secret: Zeroizing<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_expires_in: Option<u64>,
}

struct RefreshToken {
    value: Zeroizing<String>,
    expires_at: Instant,
}

/// Keycloak token endpoint client.
pub struct KeycloakAuthenticator {
    http_client: Client,
    token_url: String,
    credentials: Credentials,
    refresh: Mutex<Option<RefreshToken>>,
}

impl KeycloakAuthenticator {
    /// Creates a client for the given token endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(token_url: impl Into<String>, credentials: Credentials) -> Result<Self, AuthError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Unavailable(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            token_url: token_url.into(),
            credentials,
            refresh: Mutex::new(None),
        })
    }

    fn take_refresh_token(&self) -> Option<Zeroizing<String>> {
        let mut slot = self.refresh.lock().ok()?;
        match slot.take() {
            Some(token) if Instant::now() < token.expires_at => Some(token.value),
            _ => None,
        }
    }

    fn store_refresh_token(&self, response: &TokenResponse) {
        let Ok(mut slot) = self.refresh.lock() else {
            return;
        };
        *slot = match (&response.refresh_token, response.refresh_expires_in) {
            (Some(value), Some(secs)) if secs > 0 => Some(RefreshToken {
                value: Zeroizing::new(value.clone()),
                expires_at: Instant::now() + Duration::from_secs(secs),
            }),
            _ => None,
        };
    }

    async fn request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthError::Unavailable(format!("request timed out after {REQUEST_TIMEOUT:?}"))
                } else if e.is_connect() {
                    AuthError::Unavailable(format!("connection failed: {e}"))
                } else {
                    AuthError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();

        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::InvalidCredentials(format!("{status}: {body}")));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::InvalidResponse(format!(
                "unexpected status {status}: {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("failed to parse token response: {e}")))
    }

    async fn password_grant(&self) -> Result<TokenResponse, AuthError> {
        let creds = &self.credentials;
        self.request(&[
            ("grant_type", "password"),
            ("username", creds.username.as_str()),
            ("password", creds.password.as_str()),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
        ])
        .await
    }

    async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let creds = &self.credentials;
        self.request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
        ])
        .await
    }
}

impl fmt::Debug for KeycloakAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeycloakAuthenticator")
            .field("token_url", &self.token_url)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl Authenticator for KeycloakAuthenticator {
    async fn get_token(&self) -> Result<AccessToken, AuthError> {
        let mut response = None;

        if let Some(refresh_token) = self.take_refresh_token() {
            debug!(url = %self.token_url, "Refreshing access token");
            match self.refresh_grant(&refresh_token).await {
                Ok(r) => response = Some(r),
                Err(e) => warn!(error = %e, "Refresh grant failed, falling back to password grant"),
            }
        }

        let response = match response {
            Some(r) => r,
            None => {
                debug!(url = %self.token_url, username = %self.credentials.username, "Requesting access token");
                self.password_grant().await?
            }
        };

        self.store_refresh_token(&response);
        Ok(AccessToken::new(
            response.access_token,
            Duration::from_secs(response.expires_in),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN_PATH: &str = "/realms/autodarts/protocol/openid-connect/token";

    fn credentials() -> Credentials {
        Credentials {
            username: "player@example.com".to_string(),
            password: Zeroizing::new("hunter2".to_string()),
            client_id: "relay".to_string(),
            client_secret: Zeroizing::new("client-secret".to_string()),
        }
    }

    fn create_test_client(mock_server: &MockServer) -> KeycloakAuthenticator {
        KeycloakAuthenticator::new(format!("{}{TOKEN_PATH}", mock_server.uri()), credentials())
            .expect("failed to create test client")
    }

    fn token_body(access: &str, refresh: Option<&str>) -> serde_json::Value {
        match refresh {
            Some(refresh) => serde_json::json!({
                "access_token": access,
                "expires_in": 300,
                "refresh_token": refresh,
                "refresh_expires_in": 1800,
                "token_type": "Bearer"
            }),
            None => serde_json::json!({
                "access_token": access,
                "expires_in": 300,
                "token_type": "Bearer"
            }),
        }
    }

    #[tokio::test]
    async fn password_grant_returns_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("username=player%40example.com"))
            .and(body_string_contains("client_id=relay"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-1", None)))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let token = client.get_token().await.unwrap();

        assert_eq!(token.value, "access-1");
        assert!(token.is_fresh(Duration::from_secs(200)));
        assert!(!token.is_fresh(Duration::from_secs(400)));
    }

    #[tokio::test]
    async fn uses_refresh_grant_when_refresh_token_held() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=password"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_body("access-1", Some("refresh-1"))),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_body("access-2", Some("refresh-2"))),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        assert_eq!(client.get_token().await.unwrap().value, "access-1");
        assert_eq!(client.get_token().await.unwrap().value, "access-2");
    }

    #[tokio::test]
    async fn falls_back_to_password_grant_when_refresh_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=password"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_body("access-pw", Some("stale"))),
            )
            .expect(2)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        client.get_token().await.unwrap();
        assert_eq!(client.get_token().await.unwrap().value, "access-pw");
    }

    #[tokio::test]
    async fn rejected_credentials_map_to_invalid_credentials() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Invalid user credentials"
            })))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let err = client.get_token().await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredentials(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn server_error_maps_to_invalid_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let err = client.get_token().await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidResponse(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn unparsable_body_maps_to_invalid_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let err = client.get_token().await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_maps_to_unavailable() {
        // Port 1 on localhost refuses connections
        let client = KeycloakAuthenticator::new("http://127.0.0.1:1/token", credentials()).unwrap();
        let err = client.get_token().await.unwrap_err();

        assert!(matches!(err, AuthError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let debug = format!("{:?}", credentials());
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("client-secret"));
        assert!(debug.contains("player@example.com"));
    }
}
