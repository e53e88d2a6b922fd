//! Builds the application model from the configuration and drives it
//! through a connection flow.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use console::Style;
use parking_lot::Mutex;

use eduvpn_core::{
    ApplicationModel, FileMetadataStore, InterfaceState, InterfaceStateKind, ModelSettings,
    NetworkState, NetworkStateKind, Observable, Services,
};
use eduvpn_discovery::{DiscoveryClient, HttpServerApi, Server, SignatureVerifier};
use eduvpn_oauth::{Browser, FileTokenStore, HttpTokenClient, PrintBrowser, SystemBrowser};

use crate::backend::ExportBackend;
use crate::commands::Context;

/// Choices the user made up front for prompts along the way.
#[derive(Debug, Default, Clone)]
pub struct Choices {
    pub profile: Option<String>,
    /// Country code of a secure internet location.
    pub location: Option<String>,
}

/// Slot a connect or disconnect callback writes its result into.
#[derive(Debug, Clone, Default)]
pub struct Outcome(Arc<Mutex<Option<eduvpn_core::Result<()>>>>);

impl Outcome {
    pub fn recorder(&self) -> impl FnOnce(eduvpn_core::Result<()>) + Send + 'static {
        let slot = self.0.clone();
        move |result| *slot.lock() = Some(result)
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }

    pub fn take(&self) -> Option<eduvpn_core::Result<()>> {
        self.0.lock().take()
    }
}

pub struct Session {
    pub model: ApplicationModel,
    pub backend: Arc<ExportBackend>,
}

impl Session {
    pub fn open(ctx: &Context) -> Result<Self> {
        let client = ctx.config.client();
        let oauth = ctx.config.oauth();
        let discovery = ctx.config.discovery();
        let timeout = Duration::from_secs(client.http_timeout_secs);

        let http = reqwest::Client::builder()
            .user_agent(concat!("eduvpn-cli/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let verifier = SignatureVerifier::new(&discovery.public_keys)?;
        let discovery = DiscoveryClient::new(&discovery.base_url, verifier)?
            .with_documents(discovery.server_list, discovery.organization_list)
            .with_http_client(http.clone())
            .with_timeout(timeout);
        let server_api = HttpServerApi::new()
            .with_http_client(http.clone())
            .with_timeout(timeout);
        let token_client = HttpTokenClient::new(oauth.client_id.clone())
            .with_http_client(http)
            .with_timeout(Duration::from_secs(oauth.timeout_secs));
        let browser: Arc<dyn Browser> = if ctx.no_browser {
            Arc::new(PrintBrowser)
        } else {
            Arc::new(SystemBrowser)
        };
        let backend = Arc::new(ExportBackend::new(&ctx.data_dir));

        let services = Services {
            server_api: Arc::new(server_api),
            token_client: Arc::new(token_client),
            browser,
            token_store: Arc::new(FileTokenStore::new(&ctx.data_dir)),
            metadata_store: Arc::new(FileMetadataStore::new(&ctx.data_dir)),
            backend: backend.clone(),
            discovery: Arc::new(discovery),
        };
        let model = ApplicationModel::new(services, ModelSettings::from_config(&ctx.config));
        Ok(Self { model, backend })
    }

    /// Load persisted state and wait until the backend reported any surviving
    /// connection.
    pub async fn start(ctx: &Context) -> Result<Self> {
        let mut session = Self::open(ctx)?;
        session.model.start();
        session
            .settle(|m| m.interface_state().kind() != InterfaceStateKind::Initial)
            .await?;
        Ok(session)
    }

    /// Run the model until `done` holds. Ctrl-C abandons a pending
    /// authorization and fails.
    pub async fn settle<P>(&mut self, done: P) -> Result<()>
    where
        P: Fn(&ApplicationModel) -> bool,
    {
        let interrupted = tokio::select! {
            alive = self.model.run_until(done) => {
                if !alive {
                    bail!("The client shut down unexpectedly");
                }
                false
            }
            _ = tokio::signal::ctrl_c() => true,
        };
        if interrupted {
            if self.model.is_oauth_started() {
                let _ = self.model.cancel_oauth();
            }
            self.model.flush().await;
            bail!("Interrupted");
        }
        Ok(())
    }

    /// Run the model until `outcome` was reported and return it.
    pub async fn wait(&mut self, outcome: &Outcome) -> Result<()> {
        let reported = outcome.clone();
        self.settle(move |_| reported.is_set()).await?;
        match outcome.take() {
            Some(Err(e)) => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Follow a connect or renew flow until the tunnel is up, answering
    /// profile and location prompts from `choices`.
    pub async fn drive(&mut self, choices: &Choices) -> Result<()> {
        let mut announced: Option<String> = None;
        loop {
            self.settle(|m| needs_attention(m, announced.as_deref())).await?;

            match self.model.interface_state().underlying().clone() {
                InterfaceState::ConnectionStatus { .. } => match self.model.network_state() {
                    NetworkState::ConnectionError { description, .. } => {
                        bail!("Connection failed: {}", description)
                    }
                    _ => return Ok(()),
                },
                InterfaceState::OAuthInProgress {
                    authorization_url: Some(url),
                    ..
                } => {
                    let dim = Style::new().dim();
                    eprintln!("Complete the login in your browser. If it did not open, visit:");
                    eprintln!("  {}", dim.apply_to(&url));
                    announced = Some(url);
                }
                InterfaceState::ChooseProfile { profiles, .. } => {
                    let requested = choices.profile.as_deref().ok_or_else(|| {
                        let ids: Vec<_> = profiles.iter().map(|p| p.id.as_str()).collect();
                        anyhow!("The server offers several profiles, pick one with --profile: {}", ids.join(", "))
                    })?;
                    let profile = profiles
                        .iter()
                        .find(|p| p.id == requested)
                        .cloned()
                        .ok_or_else(|| anyhow!("The server does not offer profile '{}'", requested))?;
                    self.model.set_profile(profile, true)?;
                }
                InterfaceState::ChooseSecureInternetLocation { locations, .. } => {
                    let requested = choices.location.as_deref().ok_or_else(|| {
                        let codes: Vec<_> = locations.iter().map(|l| l.country_code.as_str()).collect();
                        anyhow!("Pick a secure internet location with --location: {}", codes.join(", "))
                    })?;
                    let location = locations
                        .iter()
                        .find(|l| l.country_code.eq_ignore_ascii_case(requested))
                        .cloned()
                        .ok_or_else(|| anyhow!("No secure internet location '{}'", requested))?;
                    self.model.select_location(location)?;
                }
                InterfaceState::Error { error, .. } | InterfaceState::OAuthFailed { error, .. } => {
                    bail!("{}", error)
                }
                _ => bail!("Connection cancelled"),
            }
        }
    }

    /// Find a server by login URL among the configured servers, then in
    /// discovery, then treat `query` as an address.
    pub async fn resolve(&mut self, query: &str) -> Result<Server> {
        if let Some(server) = self.configured(query) {
            return Ok(server);
        }

        self.search(query).await?;
        match self.model.interface_state().underlying() {
            InterfaceState::CustomServerEntry { server, .. } => Ok(server.clone()),
            InterfaceState::SearchResults { results, .. } => match results.as_slice() {
                [server] => Ok(server.clone()),
                [] => bail!("No server matches '{}'", query),
                several => bail!(
                    "'{}' matches {} servers, be more specific (try `eduvpn search`)",
                    query,
                    several.len()
                ),
            },
            InterfaceState::Error { error, .. } => bail!("Search failed: {}", error),
            other => bail!("Unexpected state {:?}", other.kind()),
        }
    }

    /// The configured server whose login URL or address is `query`.
    pub fn configured(&self, query: &str) -> Option<Server> {
        let normalized = eduvpn_discovery::CustomServer::from_input(query).base_url;
        self.model
            .database()
            .all_configured()
            .iter()
            .find(|s| s.login_url() == query || s.login_url() == normalized)
            .cloned()
    }

    /// Run a search and wait for discovery if needed.
    pub async fn search(&mut self, query: &str) -> Result<()> {
        if self.model.interface_state().underlying().kind() == InterfaceStateKind::ConnectionStatus {
            self.model.go_back()?;
        }
        self.model.search(query)?;
        self.settle(|m| m.interface_state().kind() != InterfaceStateKind::PendingSearch)
            .await
    }

    /// Wait for outstanding store writes.
    pub async fn close(mut self) {
        self.model.flush().await;
    }
}

/// States the CLI has to act on.
fn needs_attention(model: &ApplicationModel, announced: Option<&str>) -> bool {
    use InterfaceStateKind as K;
    let state = model.interface_state().underlying();
    match state.kind() {
        K::ConnectionStatus => matches!(
            model.network_state().kind(),
            NetworkStateKind::Connected | NetworkStateKind::ConnectionError
        ),
        K::OAuthInProgress => matches!(
            state,
            InterfaceState::OAuthInProgress {
                authorization_url: Some(url),
                ..
            } if Some(url.as_str()) != announced
        ),
        K::ChooseProfile
        | K::ChooseSecureInternetLocation
        | K::Error
        | K::OAuthFailed
        | K::MainList
        | K::SearchResults => true,
        _ => false,
    }
}
