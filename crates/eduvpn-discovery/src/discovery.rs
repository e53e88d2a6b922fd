//! Fetching the signed server and organization lists.
//!
//! Each document is downloaded together with its `.minisig` file and only
//! parsed after the signature checked out. The `v` field of a document must
//! never go backwards compared to the last accepted one.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DiscoveryError, Result};
use crate::signature::SignatureVerifier;
use crate::types::{InstituteServer, Organization, SecureInternetServer};

/// Default timeout for discovery requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Versions of the last accepted discovery documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryVersions {
    pub server_list: u64,
    pub organization_list: u64,
}

/// Immutable view of the discovery data. Replaced wholesale on refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySnapshot {
    pub versions: DiscoveryVersions,
    pub institutes: Vec<InstituteServer>,
    pub organizations: Vec<Organization>,
    pub locations: Vec<SecureInternetServer>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "server_type")]
enum ListedServer {
    #[serde(rename = "institute_access")]
    InstituteAccess(InstituteServer),
    #[serde(rename = "secure_internet")]
    SecureInternet(SecureInternetServer),
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    v: u64,
    server_list: Vec<ListedServer>,
}

#[derive(Debug, Deserialize)]
struct OrganizationList {
    v: u64,
    organization_list: Vec<Organization>,
}

/// Source of discovery snapshots.
#[async_trait]
pub trait DiscoverySource: Send + Sync + std::fmt::Debug {
    /// Fetch fresh discovery data, rejecting documents older than `previous`.
    async fn fetch(&self, previous: Option<DiscoveryVersions>) -> Result<DiscoverySnapshot>;
}

/// Downloads discovery documents over HTTPS.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    base_url: Url,
    server_list: String,
    organization_list: String,
    verifier: SignatureVerifier,
    timeout: Duration,
}

impl DiscoveryClient {
    /// Create a client for the documents below `base_url`.
    pub fn new(base_url: &str, verifier: SignatureVerifier) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
            server_list: "server_list.json".to_string(),
            organization_list: "organization_list.json".to_string(),
            verifier,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the document file names.
    pub fn with_documents(
        mut self,
        server_list: impl Into<String>,
        organization_list: impl Into<String>,
    ) -> Self {
        self.server_list = server_list.into();
        self.organization_list = organization_list.into();
        self
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

    /// Download `name` and its signature, returning the verified bytes.
    async fn fetch_verified(&self, name: &str) -> Result<Vec<u8>> {
        let document = self.get_bytes(name).await?;
        let signature = self
            .get_bytes(&format!("{}.minisig", name))
            .await
            .map_err(|e| match e {
                DiscoveryError::Api { status, .. } => {
                    DiscoveryError::Signature(format!("signature for {} unavailable ({})", name, status))
                }
                other => other,
            })?;
        let signature = String::from_utf8(signature)
            .map_err(|_| DiscoveryError::Signature(format!("signature for {} is not text", name)))?;

        self.verifier.verify(&document, &signature)?;
        Ok(document)
    }

    async fn get_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let url = self.base_url.join(name)?;
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Api {
                status: status.as_u16(),
                message: format!("failed to fetch {}", name),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl DiscoverySource for DiscoveryClient {
    async fn fetch(&self, previous: Option<DiscoveryVersions>) -> Result<DiscoverySnapshot> {
        let previous = previous.unwrap_or_default();

        let servers: ServerList = serde_json::from_slice(&self.fetch_verified(&self.server_list).await?)?;
        check_version(&self.server_list, previous.server_list, servers.v)?;

        let organizations: OrganizationList =
            serde_json::from_slice(&self.fetch_verified(&self.organization_list).await?)?;
        check_version(
            &self.organization_list,
            previous.organization_list,
            organizations.v,
        )?;

        let mut snapshot = DiscoverySnapshot {
            versions: DiscoveryVersions {
                server_list: servers.v,
                organization_list: organizations.v,
            },
            organizations: organizations.organization_list,
            ..Default::default()
        };
        for server in servers.server_list {
            match server {
                ListedServer::InstituteAccess(s) => snapshot.institutes.push(s),
                ListedServer::SecureInternet(s) => snapshot.locations.push(s),
                ListedServer::Unsupported => {}
            }
        }

        tracing::info!(
            institutes = snapshot.institutes.len(),
            organizations = snapshot.organizations.len(),
            locations = snapshot.locations.len(),
            "Fetched discovery data"
        );
        Ok(snapshot)
    }
}

fn check_version(document: &str, previous: u64, received: u64) -> Result<()> {
    if received < previous {
        tracing::warn!(document, previous, received, "Rejecting discovery rollback");
        return Err(DiscoveryError::Rollback {
            document: document.to_string(),
            previous,
            received,
        });
    }
    Ok(())
}
