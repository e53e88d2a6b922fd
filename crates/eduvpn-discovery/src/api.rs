//! Client for the VPN server API (version 3).
//!
//! - `GET  <base>/.well-known/vpn-user-portal` → endpoints
//! - `GET  <api>/info` → profile list
//! - `POST <api>/connect` → VPN configuration, lifetime in `Expires`
//! - `POST <api>/disconnect`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE, EXPIRES};
use serde::Deserialize;
use url::Url;

use crate::error::{DiscoveryError, Result};
use crate::localized::LocalizedString;
use crate::types::{Profile, Protocol, ServerInfo};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Well-known path of the server info document.
const WELL_KNOWN_PATH: &str = ".well-known/vpn-user-portal";

/// Info document namespace of the supported API version.
const API_NAMESPACE: &str = "http://eduvpn.org/api#3";

const OPENVPN_CONTENT_TYPE: &str = "application/x-openvpn-profile";
const WIREGUARD_CONTENT_TYPE: &str = "application/x-wireguard-profile";

/// Parameters of a connect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub profile_id: String,
    /// WireGuard public key, sent when the profile supports WireGuard.
    pub public_key: Option<String>,
    pub prefer_tcp: bool,
}

/// A VPN configuration issued by a server.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub protocol: Protocol,
    pub config: String,
    pub expires: DateTime<Utc>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("protocol", &self.protocol)
            .field("config", &format!("[{} bytes]", self.config.len()))
            .field("expires", &self.expires)
            .finish()
    }
}

impl ConnectionConfig {
    /// Insert `PrivateKey` into the `[Interface]` section of a WireGuard
    /// configuration. OpenVPN configurations are returned unchanged.
    pub fn with_private_key(mut self, private_key: &str) -> Self {
        if self.protocol != Protocol::WireGuard {
            return self;
        }
        let mut out = String::with_capacity(self.config.len() + 64);
        let mut inserted = false;
        for line in self.config.lines() {
            out.push_str(line);
            out.push('\n');
            if !inserted && line.trim() == "[Interface]" {
                out.push_str("PrivateKey = ");
                out.push_str(private_key);
                out.push('\n');
                inserted = true;
            }
        }
        self.config = out;
        self
    }
}

/// Operations a VPN server offers to an authorized client.
#[async_trait]
pub trait ServerApi: Send + Sync + std::fmt::Debug {
    /// Fetch the endpoints advertised below `base_url`.
    async fn server_info(&self, base_url: &str) -> Result<ServerInfo>;

    /// List the profiles available to the token holder.
    async fn profiles(&self, info: &ServerInfo, access_token: &str) -> Result<Vec<Profile>>;

    /// Obtain a configuration for a profile.
    async fn connect(
        &self,
        info: &ServerInfo,
        access_token: &str,
        request: &ConnectRequest,
    ) -> Result<ConnectionConfig>;

    /// Release the configuration obtained last.
    async fn disconnect(&self, info: &ServerInfo, access_token: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct InfoDocument {
    api: std::collections::HashMap<String, ServerInfo>,
}

#[derive(Debug, Deserialize)]
struct ProfileInfoResponse {
    info: ProfileInfo,
}

#[derive(Debug, Deserialize)]
struct ProfileInfo {
    profile_list: Vec<ApiProfile>,
}

#[derive(Debug, Deserialize)]
struct ApiProfile {
    profile_id: String,
    display_name: LocalizedString,
    #[serde(default)]
    default_gateway: bool,
    #[serde(default)]
    vpn_proto_list: Vec<String>,
}

impl From<ApiProfile> for Profile {
    fn from(p: ApiProfile) -> Self {
        let protocols = p
            .vpn_proto_list
            .iter()
            .filter_map(|name| match name.as_str() {
                "openvpn" => Some(Protocol::OpenVpn),
                "wireguard" => Some(Protocol::WireGuard),
                _ => None,
            })
            .collect();
        Profile {
            id: p.profile_id,
            display_name: p.display_name,
            default_gateway: p.default_gateway,
            protocols,
        }
    }
}

/// `reqwest`-backed server API client.
#[derive(Debug, Clone)]
pub struct HttpServerApi {
    http: reqwest::Client,
    timeout: Duration,
}

impl Default for HttpServerApi {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpServerApi {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
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

    fn endpoint(info: &ServerInfo, name: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/{}",
            info.api_endpoint.trim_end_matches('/'),
            name
        ))?)
    }

    /// Turn non-success responses into errors.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DiscoveryError::Unauthorized(message));
        }
        Err(DiscoveryError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn server_info(&self, base_url: &str) -> Result<ServerInfo> {
        let base = Url::parse(base_url)?;
        let url = base.join(WELL_KNOWN_PATH)?;
        let response = self.http.get(url).timeout(self.timeout).send().await?;
        let document: InfoDocument = Self::check(response).await?.json().await?;

        document.api.get(API_NAMESPACE).cloned().ok_or_else(|| {
            DiscoveryError::Format(format!("{} does not offer API {}", base_url, API_NAMESPACE))
        })
    }

    async fn profiles(&self, info: &ServerInfo, access_token: &str) -> Result<Vec<Profile>> {
        let response = self
            .http
            .get(Self::endpoint(info, "info")?)
            .bearer_auth(access_token)
            .timeout(self.timeout)
            .send()
            .await?;
        let body: ProfileInfoResponse = Self::check(response).await?.json().await?;
        Ok(body.info.profile_list.into_iter().map(Profile::from).collect())
    }

    async fn connect(
        &self,
        info: &ServerInfo,
        access_token: &str,
        request: &ConnectRequest,
    ) -> Result<ConnectionConfig> {
        let mut form = vec![
            ("profile_id", request.profile_id.as_str()),
            ("prefer_tcp", if request.prefer_tcp { "yes" } else { "no" }),
        ];
        if let Some(key) = &request.public_key {
            form.push(("public_key", key.as_str()));
        }
        let accept = if request.public_key.is_some() {
            format!("{}, {}", WIREGUARD_CONTENT_TYPE, OPENVPN_CONTENT_TYPE)
        } else {
            OPENVPN_CONTENT_TYPE.to_string()
        };

        tracing::debug!(profile = %request.profile_id, "Requesting VPN configuration");
        let response = self
            .http
            .post(Self::endpoint(info, "connect")?)
            .bearer_auth(access_token)
            .header(ACCEPT, accept)
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let content_type = header_str(&response, CONTENT_TYPE).unwrap_or_default();
        let protocol = if content_type.starts_with(WIREGUARD_CONTENT_TYPE) {
            Protocol::WireGuard
        } else if content_type.starts_with(OPENVPN_CONTENT_TYPE) {
            Protocol::OpenVpn
        } else {
            return Err(DiscoveryError::Format(format!(
                "unexpected configuration type '{}'",
                content_type
            )));
        };

        let expires = header_str(&response, EXPIRES)
            .ok_or_else(|| DiscoveryError::Format("configuration has no Expires header".to_string()))
            .and_then(|value| {
                DateTime::parse_from_rfc2822(&value)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| DiscoveryError::Format(format!("invalid Expires header: {}", e)))
            })?;

        Ok(ConnectionConfig {
            protocol,
            config: response.text().await?,
            expires,
        })
    }

    async fn disconnect(&self, info: &ServerInfo, access_token: &str) -> Result<()> {
        let response = self
            .http
            .post(Self::endpoint(info, "disconnect")?)
            .bearer_auth(access_token)
            .timeout(self.timeout)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
