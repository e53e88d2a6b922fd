//! Error types for the lifecycle engine.

use std::fmt;

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// A `(state, event)` pair a state machine does not define.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{machine}: no transition for {event} in state {state}")]
pub struct InvalidTransition {
    pub machine: &'static str,
    pub state: String,
    pub event: String,
}

/// Errors surfaced by the application model.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    OAuth(#[from] eduvpn_oauth::OAuthError),

    #[error(transparent)]
    Discovery(#[from] eduvpn_discovery::DiscoveryError),

    #[error(transparent)]
    Config(#[from] eduvpn_config::ConfigError),

    /// The network backend failed.
    #[error("Network backend error: {0}")]
    Backend(String),

    /// Reading or writing persisted state failed.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The flow ended in an error state.
    #[error("{0}")]
    Flow(UiError),

    /// The user cancelled the flow.
    #[error("Cancelled")]
    Cancelled,

    /// The operation needs an active connection.
    #[error("Not connected")]
    NotConnected,

    #[error("Unknown server: {0}")]
    UnknownServer(String),
}

/// Broad category of a failure shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A server or the discovery service could not be reached.
    Network,
    /// The authorization response violated the protocol.
    Protocol,
    /// Authorization failed or was rejected.
    Authorization,
    /// The discovery documents were rejected.
    Discovery,
    /// A server returned something unusable.
    Server,
    /// The network backend failed.
    Backend,
    /// Local state could not be read or written.
    Storage,
}

/// A failure carried by an interface state.
///
/// Keeps the message and category only, so states stay cloneable and
/// comparable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl UiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for UiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&eduvpn_oauth::OAuthError> for UiError {
    fn from(e: &eduvpn_oauth::OAuthError) -> Self {
        use eduvpn_oauth::OAuthError;
        let kind = match e {
            OAuthError::Network(_) => ErrorKind::Network,
            OAuthError::Protocol(_) | OAuthError::StateMismatch => ErrorKind::Protocol,
            OAuthError::Store(_) | OAuthError::Serialization(_) => ErrorKind::Storage,
            _ => ErrorKind::Authorization,
        };
        UiError::new(kind, e.to_string())
    }
}

impl From<&eduvpn_discovery::DiscoveryError> for UiError {
    fn from(e: &eduvpn_discovery::DiscoveryError) -> Self {
        use eduvpn_discovery::DiscoveryError;
        let kind = match e {
            DiscoveryError::Http(_) => ErrorKind::Network,
            DiscoveryError::Signature(_) | DiscoveryError::Rollback { .. } => ErrorKind::Discovery,
            DiscoveryError::Unauthorized(_) => ErrorKind::Authorization,
            _ => ErrorKind::Server,
        };
        UiError::new(kind, e.to_string())
    }
}

impl From<&CoreError> for UiError {
    fn from(e: &CoreError) -> Self {
        match e {
            CoreError::OAuth(e) => e.into(),
            CoreError::Discovery(e) => e.into(),
            CoreError::Flow(e) => e.clone(),
            CoreError::Backend(m) => UiError::new(ErrorKind::Backend, m.clone()),
            CoreError::Storage(_) | CoreError::Io(_) | CoreError::Json(_) => {
                UiError::new(ErrorKind::Storage, e.to_string())
            }
            _ => UiError::new(ErrorKind::Server, e.to_string()),
        }
    }
}
