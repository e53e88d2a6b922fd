//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [oauth]        # OAuth client settings
//! [discovery]    # signed server/organization lists
//! [session]      # expiry and renewal thresholds
//! [client]       # language, data directory, HTTP behaviour
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., local overrides)
/// can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EduVpnConfig {
    pub oauth: Option<OAuthSection>,
    pub discovery: Option<DiscoverySection>,
    pub session: Option<SessionSection>,
    pub client: Option<ClientSection>,
}

impl EduVpnConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: EduVpnConfig) {
        if other.oauth.is_some() {
            self.oauth = other.oauth;
        }

        if other.discovery.is_some() {
            self.discovery = other.discovery;
        }

        if other.session.is_some() {
            self.session = other.session;
        }

        if other.client.is_some() {
            self.client = other.client;
        }
    }

    /// Effective `[oauth]` section.
    pub fn oauth(&self) -> OAuthSection {
        self.oauth.clone().unwrap_or_default()
    }

    /// Effective `[discovery]` section.
    pub fn discovery(&self) -> DiscoverySection {
        self.discovery.clone().unwrap_or_default()
    }

    /// Effective `[session]` section.
    pub fn session(&self) -> SessionSection {
        self.session.clone().unwrap_or_default()
    }

    /// Effective `[client]` section.
    pub fn client(&self) -> ClientSection {
        self.client.clone().unwrap_or_default()
    }

    /// Check value ranges across all sections.
    pub fn validate(&self) -> Result<()> {
        self.oauth().validate()?;
        self.discovery().validate()?;
        self.session().validate()?;
        self.client().validate()
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// [oauth]
// ─────────────────────────────────────────────────────────────────────────────

/// OAuth client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSection {
    /// Client id registered with the VPN servers.
    pub client_id: String,
    /// Requested scope.
    pub scope: String,
    /// Path of the loopback redirect URI.
    pub callback_path: String,
    /// Path that cancels a pending authorization.
    pub cancel_path: String,
    /// Timeout for token endpoint requests, in seconds.
    pub timeout_secs: u64,
}

impl Default for OAuthSection {
    fn default() -> Self {
        Self {
            client_id: "org.eduvpn.app.linux".to_string(),
            scope: "config".to_string(),
            callback_path: "/callback".to_string(),
            cancel_path: "/cancel".to_string(),
            timeout_secs: 30,
        }
    }
}

impl OAuthSection {
    fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(invalid("oauth.client_id", "must not be empty"));
        }
        for (field, value) in [
            ("oauth.callback_path", &self.callback_path),
            ("oauth.cancel_path", &self.cancel_path),
        ] {
            if !value.starts_with('/') {
                return Err(invalid(field, "must start with '/'"));
            }
        }
        if self.callback_path == self.cancel_path {
            return Err(invalid("oauth.cancel_path", "must differ from callback_path"));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("oauth.timeout_secs", "must be positive"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// [discovery]
// ─────────────────────────────────────────────────────────────────────────────

/// Where the signed server and organization lists come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Base URL the list files are resolved against.
    pub base_url: String,
    /// Server list file name.
    pub server_list: String,
    /// Organization list file name.
    pub organization_list: String,
    /// Trusted minisign public keys (base64).
    pub public_keys: Vec<String>,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            base_url: "https://disco.eduvpn.org/v2/".to_string(),
            server_list: "server_list.json".to_string(),
            organization_list: "organization_list.json".to_string(),
            public_keys: vec![
                "RWRtBSX1alxyGX+Xn3LuZnWUT0w//B6EmTJvgaAxBMYzlQeI+jdrO6KF".to_string(),
                "RWQKqtqvd0R7rUDp0rWzbtYPA3towPWcLDCl7eY9pBMMI/ohCmrS0WiM".to_string(),
                "RWQ68Y5/b8DED0TJ41B1LE7yAvkmavZWjDwCBUuC+Z2pP9HaSawzpEDA".to_string(),
            ],
        }
    }
}

impl DiscoverySection {
    fn validate(&self) -> Result<()> {
        if !self.base_url.ends_with('/') {
            return Err(invalid("discovery.base_url", "must end with '/'"));
        }
        if self.public_keys.is_empty() {
            return Err(invalid(
                "discovery.public_keys",
                "at least one trusted key is required",
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// [session]
// ─────────────────────────────────────────────────────────────────────────────

/// Session expiry thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Fraction of the session lifetime after which expiry is pending.
    /// Default: 0.8
    pub pending_expiry_fraction: f64,

    /// Expiry is pending at the latest this many minutes before the end.
    /// Default: 5
    pub pending_expiry_lead_minutes: i64,

    /// The renew action is offered this many minutes after the start.
    /// Default: 30
    pub renew_after_minutes: i64,

    /// Notify this many minutes before the end.
    /// Default: 4 hours, 1 hour, 15 minutes
    pub notification_leads_minutes: Vec<i64>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            pending_expiry_fraction: 0.8,
            pending_expiry_lead_minutes: 5,
            renew_after_minutes: 30,
            notification_leads_minutes: vec![240, 60, 15],
        }
    }
}

impl SessionSection {
    fn validate(&self) -> Result<()> {
        if !(self.pending_expiry_fraction > 0.0 && self.pending_expiry_fraction <= 1.0) {
            return Err(invalid(
                "session.pending_expiry_fraction",
                "must be in (0, 1]",
            ));
        }
        if self.pending_expiry_lead_minutes < 0 {
            return Err(invalid("session.pending_expiry_lead_minutes", "must not be negative"));
        }
        if self.renew_after_minutes < 0 {
            return Err(invalid("session.renew_after_minutes", "must not be negative"));
        }
        if self.notification_leads_minutes.iter().any(|m| *m <= 0) {
            return Err(invalid(
                "session.notification_leads_minutes",
                "entries must be positive",
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// [client]
// ─────────────────────────────────────────────────────────────────────────────

/// General client behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Preferred language for display names.
    pub language: String,
    /// Ask servers for TCP-only connections.
    pub prefer_tcp: bool,
    /// Directory for tokens, metadata and exported configs.
    /// Default: the config directory.
    ///
    /// Can be overridden by the `EDUVPN_DATA_DIR` environment variable.
    pub data_dir: Option<PathBuf>,
    /// Timeout for server API requests, in seconds.
    pub http_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            prefer_tcp: false,
            data_dir: None,
            http_timeout_secs: 30,
        }
    }
}

impl ClientSection {
    fn validate(&self) -> Result<()> {
        if self.language.is_empty() {
            return Err(invalid("client.language", "must not be empty"));
        }
        if self.http_timeout_secs == 0 {
            return Err(invalid("client.http_timeout_secs", "must be positive"));
        }
        Ok(())
    }

    /// Get the effective data directory, checking the environment first.
    ///
    /// Resolution order:
    /// 1. `EDUVPN_DATA_DIR` environment variable
    /// 2. Configured `data_dir` value
    /// 3. Default: the eduVPN config directory
    pub fn effective_data_dir(&self) -> Result<PathBuf> {
        if let Ok(dir) = std::env::var(crate::loader::DATA_DIR_ENV)
            && !dir.is_empty()
        {
            return Ok(PathBuf::from(dir));
        }

        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::loader::xdg_config_dir().ok_or(ConfigError::NoDataDir),
        }
    }
}
