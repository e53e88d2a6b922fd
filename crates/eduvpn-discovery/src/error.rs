//! Discovery and server API error types.

use thiserror::Error;

/// Result type for discovery and server API operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors raised while discovering servers or talking to a VPN server.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The access token was rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A discovery document failed signature verification.
    #[error("Signature verification failed: {0}")]
    Signature(String),

    /// A discovery document is older than the one already known.
    #[error("Rollback of {document} from version {previous} to {received}")]
    Rollback {
        document: String,
        previous: u64,
        received: u64,
    },

    /// A response did not have the expected shape.
    #[error("Unexpected response: {0}")]
    Format(String),

    /// Key material could not be decoded.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl DiscoveryError {
    /// Check if the previous discovery snapshot should be kept because the
    /// new documents could not be trusted.
    pub fn is_signature_failure(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Signature(_) | DiscoveryError::Rollback { .. }
        )
    }

    /// Check if this is an authentication error.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, DiscoveryError::Unauthorized(_))
            || matches!(self, DiscoveryError::Api { status: 401, .. })
    }
}
