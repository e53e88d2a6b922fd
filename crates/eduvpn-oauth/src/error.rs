//! Error types for the authorization flow.

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, OAuthError>;

/// Errors that can occur while authorizing against a VPN server.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// Network/HTTP error talking to the token endpoint.
    #[error("Network error: {0}")]
    Network(String),

    /// The token endpoint answered with a non-success status.
    #[error("Token endpoint returned {status}: {error}")]
    TokenEndpoint {
        status: u16,
        error: String,
        description: Option<String>,
    },

    /// The token endpoint answered 200 with a body that is not a usable token.
    #[error("Invalid token response: {0}")]
    InvalidTokenResponse(String),

    /// The refresh token (or authorization code) is no longer accepted.
    #[error("Grant rejected by the authorization server: {0}")]
    InvalidGrant(String),

    /// The redirect did not carry the parameters the flow requires.
    #[error("Malformed authorization response: {0}")]
    Protocol(String),

    /// The `state` of the redirect does not match the challenge.
    #[error("Authorization state mismatch")]
    StateMismatch,

    /// The loopback callback listener could not be set up.
    #[error("Callback listener error: {0}")]
    Listener(String),

    /// The system browser could not be launched.
    #[error("Failed to open browser: {0}")]
    Browser(String),

    /// Invalid endpoint or redirect URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Token store error.
    #[error("Token store error: {0}")]
    Store(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OAuthError {
    /// Whether the authorization server rejected the grant, meaning a fresh
    /// authorization is required.
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, OAuthError::InvalidGrant(_))
    }

    /// Whether this error is a violation of the authorization protocol
    /// (as opposed to a transient failure).
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, OAuthError::Protocol(_) | OAuthError::StateMismatch)
    }
}

impl From<reqwest::Error> for OAuthError {
    fn from(e: reqwest::Error) -> Self {
        OAuthError::Network(e.to_string())
    }
}

impl From<url::ParseError> for OAuthError {
    fn from(e: url::ParseError) -> Self {
        OAuthError::InvalidUrl(e.to_string())
    }
}

impl From<serde_json::Error> for OAuthError {
    fn from(e: serde_json::Error) -> Self {
        OAuthError::Serialization(e.to_string())
    }
}
