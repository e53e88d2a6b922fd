//! Shared fixtures for the model integration tests.
//!
//! A wiremock server plays the VPN server (info document, token endpoint,
//! API). The browser double follows the authorization redirect and the
//! backend double reports every call to a shared log.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use eduvpn_core::{
    ApplicationModel, InMemoryMetadataStore, MetadataMap, ModelSettings, NetworkBackend, Result,
    Services, StatusReporter, VpnConnection,
};
use eduvpn_discovery::{
    DiscoveryError, DiscoverySnapshot, DiscoverySource, DiscoveryVersions, HttpServerApi,
    InstituteServer, Server,
};
use eduvpn_oauth::{Browser, HttpTokenClient, InMemoryTokenStore, OAuthToken, StoredToken, TokenMap};

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().clone()
}

/// Position of the first call starting with `prefix`.
pub fn position(log: &CallLog, prefix: &str) -> Option<usize> {
    log.lock().iter().position(|c| c.starts_with(prefix))
}

pub fn count(log: &CallLog, prefix: &str) -> usize {
    log.lock().iter().filter(|c| c.starts_with(prefix)).count()
}

// ─────────────────────────────────────────────────────────────────────────────
// VPN server
// ─────────────────────────────────────────────────────────────────────────────

pub struct VpnServer {
    pub mock: MockServer,
}

impl VpnServer {
    pub async fn start() -> Self {
        let mock = MockServer::start().await;
        let uri = mock.uri();

        Mock::given(method("GET"))
            .and(path("/.well-known/vpn-user-portal"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "api": {
                    "http://eduvpn.org/api#3": {
                        "api_endpoint": format!("{}/api/v3", uri),
                        "authorization_endpoint": format!("{}/oauth/authorize", uri),
                        "token_endpoint": format!("{}/oauth/token", uri)
                    }
                },
                "v": "3.0.0"
            })))
            .mount(&mock)
            .await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-1",
                "refresh_token": "refresh-1",
                "token_type": "bearer",
                "expires_in": 3600
            })))
            .mount(&mock)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v3/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "info": {
                    "profile_list": [{
                        "profile_id": "internet",
                        "display_name": "Internet",
                        "default_gateway": true,
                        "vpn_proto_list": ["openvpn"]
                    }]
                }
            })))
            .mount(&mock)
            .await;

        let expires = (Utc::now() + chrono::Duration::hours(1)).to_rfc2822();
        Mock::given(method("POST"))
            .and(path("/api/v3/connect"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("expires", expires.as_str())
                    .set_body_raw("client\ndev tun\n", "application/x-openvpn-profile"),
            )
            .mount(&mock)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/v3/disconnect"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock)
            .await;

        Self { mock }
    }

    /// Reject the next refresh with `invalid_grant`.
    pub async fn reject_next_refresh(&self) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "refresh token expired"
            })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&self.mock)
            .await;
    }

    /// Answer the authorization code exchange with a maintenance page.
    pub async fn serve_unusable_token_response(&self) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html>maintenance</html>"),
            )
            .with_priority(1)
            .mount(&self.mock)
            .await;
    }

    pub fn base_url(&self) -> String {
        format!("{}/", self.mock.uri())
    }

    pub fn institute(&self) -> Server {
        Server::InstituteAccess(InstituteServer {
            base_url: self.base_url(),
            display_name: "Example University".into(),
            keywords: None,
            support_contacts: vec![],
        })
    }

    pub fn stored_token(&self) -> StoredToken {
        StoredToken {
            token: OAuthToken {
                access_token: "access-0".to_string(),
                refresh_token: "refresh-0".to_string(),
                token_type: "bearer".to_string(),
                expires_at: Utc::now() + chrono::Duration::minutes(10),
            },
            token_endpoint: format!("{}/oauth/token", self.mock.uri()),
            authorization_endpoint: format!("{}/oauth/authorize", self.mock.uri()),
        }
    }

    pub async fn requests_to(&self, request_path: &str) -> usize {
        self.mock
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == request_path)
            .count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Doubles
// ─────────────────────────────────────────────────────────────────────────────

/// Network backend that records calls and comes up instantly.
#[derive(Debug, Default)]
pub struct FakeBackend {
    log: CallLog,
    reporter: Mutex<Option<StatusReporter>>,
    active: Option<String>,
    saved: Mutex<Vec<VpnConnection>>,
}

impl FakeBackend {
    pub fn new(log: CallLog, active: Option<String>) -> Self {
        Self {
            log,
            active,
            ..Default::default()
        }
    }

    pub fn saved(&self) -> Vec<VpnConnection> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl NetworkBackend for FakeBackend {
    fn attach(&self, reporter: StatusReporter) {
        *self.reporter.lock() = Some(reporter);
    }

    async fn active_connection(&self) -> Result<Option<String>> {
        Ok(self.active.clone())
    }

    async fn save(&self, connection: &VpnConnection) -> Result<()> {
        self.log.lock().push(format!("save {}", connection.server.login_url()));
        self.saved.lock().push(connection.clone());
        Ok(())
    }

    async fn remove(&self, server: &Server) -> Result<()> {
        self.log.lock().push(format!("remove {}", server.login_url()));
        Ok(())
    }

    fn activate(&self, server: &Server) {
        self.log.lock().push(format!("activate {}", server.login_url()));
        if let Some(reporter) = self.reporter.lock().as_ref() {
            reporter.established();
        }
    }

    fn deactivate(&self, server: &Server) {
        self.log.lock().push(format!("deactivate {}", server.login_url()));
    }
}

/// Browser double that completes the login by requesting the redirect URI.
#[derive(Debug)]
pub struct RedirectingBrowser {
    log: CallLog,
    redirect: bool,
}

impl Browser for RedirectingBrowser {
    fn open(&self, url: &str) -> eduvpn_oauth::Result<()> {
        self.log.lock().push("browser".to_string());
        if !self.redirect {
            return Ok(());
        }

        let url = Url::parse(url)?;
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let mut redirect = Url::parse(&query["redirect_uri"])?;
        redirect
            .query_pairs_mut()
            .append_pair("code", "code-1")
            .append_pair("state", &query["state"]);
        tokio::spawn(async move {
            let _ = reqwest::get(redirect).await;
        });
        Ok(())
    }
}

/// Discovery double serving a fixed snapshot. After `fail_after`
/// successful fetches every fetch fails signature verification.
#[derive(Debug)]
struct StaticDiscovery {
    snapshot: DiscoverySnapshot,
    fail_after: Option<usize>,
    fetches: AtomicUsize,
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn fetch(
        &self,
        _previous: Option<DiscoveryVersions>,
    ) -> eduvpn_discovery::Result<DiscoverySnapshot> {
        let done = self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.fail_after {
            Some(limit) if done >= limit => Err(DiscoveryError::Signature(
                "server_list.json.minisig does not match".to_string(),
            )),
            _ => Ok(self.snapshot.clone()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Options {
    /// Whether the browser completes the login.
    pub manual_login: bool,
    pub tokens: TokenMap,
    pub metadata: MetadataMap,
    pub active: Option<String>,
    /// Successful discovery fetches before the documents stop verifying.
    pub discovery_fails_after: Option<usize>,
}

pub struct Harness {
    pub model: ApplicationModel,
    pub log: CallLog,
    pub backend: Arc<FakeBackend>,
    pub token_store: Arc<InMemoryTokenStore>,
    pub metadata_store: Arc<InMemoryMetadataStore>,
}

impl Harness {
    pub fn new(server: &VpnServer, options: Options) -> Self {
        let log = CallLog::default();
        let backend = Arc::new(FakeBackend::new(log.clone(), options.active));
        let token_store = Arc::new(InMemoryTokenStore::with_tokens(options.tokens));
        let metadata_store = Arc::new(InMemoryMetadataStore::with_entries(options.metadata));
        let discovery = StaticDiscovery {
            snapshot: DiscoverySnapshot {
                versions: DiscoveryVersions {
                    server_list: 1,
                    organization_list: 1,
                },
                institutes: match server.institute() {
                    Server::InstituteAccess(institute) => vec![institute],
                    _ => vec![],
                },
                organizations: vec![],
                locations: vec![],
            },
            fail_after: options.discovery_fails_after,
            fetches: AtomicUsize::new(0),
        };

        let services = Services {
            server_api: Arc::new(HttpServerApi::new()),
            token_client: Arc::new(HttpTokenClient::new("org.eduvpn.app.linux")),
            browser: Arc::new(RedirectingBrowser {
                log: log.clone(),
                redirect: !options.manual_login,
            }),
            token_store: token_store.clone(),
            metadata_store: metadata_store.clone(),
            backend: backend.clone(),
            discovery: Arc::new(discovery),
        };

        Self {
            model: ApplicationModel::new(services, ModelSettings::default()),
            log,
            backend,
            token_store,
            metadata_store,
        }
    }

    /// Run the model loop until `done` holds, failing after a few seconds.
    pub async fn settle<P>(&mut self, done: P)
    where
        P: Fn(&ApplicationModel) -> bool,
    {
        let reached = tokio::time::timeout(Duration::from_secs(10), self.model.run_until(done))
            .await
            .expect("model did not reach the expected state in time");
        assert!(reached, "model loop shut down");
    }

    /// Run the model loop for `duration`, applying whatever arrives.
    pub async fn drain(&mut self, duration: Duration) {
        let _ = tokio::time::timeout(duration, self.model.run_until(|_| false)).await;
    }
}
