//! OAuth tokens and the token endpoint client.
//!
//! Speaks plain RFC 6749: form-encoded requests, JSON responses, and the
//! standard `error` / `error_description` fields on failure.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OAuthError, Result};

/// Default timeout for token endpoint requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// An access/refresh token pair with its absolute expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl OAuthToken {
    /// Whether the access token is expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until the access token expires (zero when expired).
    pub fn expires_in(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }
}

impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
}

impl TokenResponse {
    fn into_token(self, previous_refresh: Option<&str>) -> Result<OAuthToken> {
        let now = Utc::now();
        let expires_at = match (self.expires_in, self.expires_at) {
            (Some(secs), _) => now + chrono::Duration::seconds(secs),
            (None, Some(ts)) => DateTime::from_timestamp(ts, 0).ok_or_else(|| {
                OAuthError::InvalidTokenResponse(format!("invalid expires_at timestamp {}", ts))
            })?,
            (None, None) => {
                return Err(OAuthError::InvalidTokenResponse(
                    "token response carries no expiry".to_string(),
                ));
            }
        };

        let refresh_token = match (self.refresh_token, previous_refresh) {
            (Some(token), _) if !token.is_empty() => token,
            (_, Some(previous)) => previous.to_string(),
            _ => {
                return Err(OAuthError::InvalidTokenResponse(
                    "token response carries no refresh token".to_string(),
                ));
            }
        };

        Ok(OAuthToken {
            access_token: self.access_token,
            refresh_token,
            token_type: self.token_type.unwrap_or_else(default_token_type),
            expires_at,
        })
    }
}

/// Error body returned by the token endpoint.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Talks to an OAuth token endpoint.
#[async_trait]
pub trait TokenClient: Send + Sync + std::fmt::Debug {
    /// Exchange an authorization code for a token.
    async fn fetch_token(
        &self,
        token_endpoint: &str,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<OAuthToken>;

    /// Obtain a new access token using the refresh token.
    async fn refresh_token(&self, token_endpoint: &str, token: &OAuthToken) -> Result<OAuthToken>;
}

/// `reqwest`-backed token client.
#[derive(Debug, Clone)]
pub struct HttpTokenClient {
    http: reqwest::Client,
    client_id: String,
    timeout: Duration,
}

impl HttpTokenClient {
    /// Create a token client for the given OAuth client id.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: client_id.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use a shared HTTP client.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn post_form(
        &self,
        token_endpoint: &str,
        form: &[(&str, &str)],
        previous_refresh: Option<&str>,
    ) -> Result<OAuthToken> {
        let response = self
            .http
            .post(token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| OAuthError::Network(format!("Token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(token_endpoint_error(status.as_u16(), &body));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            OAuthError::InvalidTokenResponse(format!("Failed to parse token response: {}", e))
        })?;
        body.into_token(previous_refresh)
    }
}

#[async_trait]
impl TokenClient for HttpTokenClient {
    async fn fetch_token(
        &self,
        token_endpoint: &str,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<OAuthToken> {
        tracing::debug!(endpoint = %token_endpoint, "Exchanging authorization code");
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", verifier),
        ];
        self.post_form(token_endpoint, &form, None).await
    }

    async fn refresh_token(&self, token_endpoint: &str, token: &OAuthToken) -> Result<OAuthToken> {
        tracing::debug!(endpoint = %token_endpoint, "Refreshing access token");
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", token.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        self.post_form(token_endpoint, &form, Some(&token.refresh_token))
            .await
    }
}

/// Map a failed token endpoint response to an error.
fn token_endpoint_error(status: u16, body: &str) -> OAuthError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) if err.error == "invalid_grant" => {
            OAuthError::InvalidGrant(err.error_description.unwrap_or(err.error))
        }
        Ok(err) => OAuthError::TokenEndpoint {
            status,
            error: err.error,
            description: err.error_description,
        },
        Err(_) => OAuthError::TokenEndpoint {
            status,
            error: if body.is_empty() {
                "unknown_error".to_string()
            } else {
                body.to_string()
            },
            description: None,
        },
    }
}
