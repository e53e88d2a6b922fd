//! The application model.
//!
//! [`ApplicationModel`] owns the interface and network machines and all data
//! their transitions consult. Every transition runs on the model's loop.
//! Work that blocks (HTTP, the callback listener, the stores) is spawned as
//! a task that reports back through the [`Dispatcher`].
//!
//! ```text
//! user op ──► InterfaceState::transition ──► commands ──► spawned tasks
//!                    ▲                                        │
//!                    └────────── Message via Dispatcher ◄─────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use eduvpn_config::{EduVpnConfig, SessionSection};
use eduvpn_discovery::{
    ConnectRequest, CountryNames, DiscoveryError, DiscoverySnapshot, DiscoverySource, Profile,
    Protocol, SecureInternetServer, Server, ServerApi, ServerDatabase, ServerInfo,
    WireGuardKeypair,
};
use eduvpn_oauth::{
    AuthorizedSession, Authorizer, Browser, CallbackPaths, OAuthClientConfig, OAuthError,
    SharedTokenStore, StopHandle, StoredToken, TokenClient, TokenMap,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::dispatch::{Dispatcher, FlowId, Message, Startup, StatusReporter};
use crate::error::{CoreError, InvalidTransition, Result, UiError};
use crate::interface::{
    Command, InterfaceEvent, InterfaceState, InterfaceStateKind, TransitionContext,
};
use crate::metadata::{MetadataMap, MetadataStore, ServerMetadata};
use crate::network::{NetworkBackend, NetworkEvent, NetworkState, NetworkStateKind, VpnConnection};
use crate::notify::{Edge, Notifier, Observable, SubscriptionId};
use crate::validity::SessionValidity;

/// How often [`ApplicationModel::run`] checks the session validity.
const TICK_INTERVAL: StdDuration = StdDuration::from_secs(1);

/// Receives the outcome of a connect or disconnect.
pub type Callback = Box<dyn FnOnce(Result<()>) + Send>;

// ─────────────────────────────────────────────────────────────────────────────
// Services and settings
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the model talks to.
#[derive(Debug, Clone)]
pub struct Services {
    pub server_api: Arc<dyn ServerApi>,
    pub token_client: Arc<dyn TokenClient>,
    pub browser: Arc<dyn Browser>,
    pub token_store: SharedTokenStore,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub backend: Arc<dyn NetworkBackend>,
    pub discovery: Arc<dyn DiscoverySource>,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub oauth: OAuthClientConfig,
    pub session: SessionSection,
    /// Language used for display names.
    pub language: String,
    pub prefer_tcp: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            oauth: OAuthClientConfig::default(),
            session: SessionSection::default(),
            language: "en".to_string(),
            prefer_tcp: false,
        }
    }
}

impl ModelSettings {
    pub fn from_config(config: &EduVpnConfig) -> Self {
        let oauth = config.oauth();
        let client = config.client();
        Self {
            oauth: OAuthClientConfig {
                client_id: oauth.client_id,
                scope: oauth.scope,
                paths: CallbackPaths {
                    callback: oauth.callback_path,
                    cancel: oauth.cancel_path,
                },
            },
            session: config.session(),
            language: client.language,
            prefer_tcp: client.prefer_tcp,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model
// ─────────────────────────────────────────────────────────────────────────────

pub struct ApplicationModel {
    services: Services,
    settings: ModelSettings,
    authorizer: Authorizer,

    interface: InterfaceState,
    network: NetworkState,
    interface_notifier: Notifier<InterfaceState>,
    network_notifier: Notifier<NetworkState>,

    database: ServerDatabase,
    tokens: TokenMap,
    /// Tokens obtained by an authorization and not yet written to the store.
    unsaved_tokens: HashSet<String>,
    metadata: MetadataMap,
    /// Server info documents by base URL.
    server_info: HashMap<String, ServerInfo>,
    validity: Option<SessionValidity>,
    last_tick: Option<DateTime<Utc>>,

    dispatcher: Dispatcher,
    inbox: mpsc::UnboundedReceiver<Message>,
    flow: FlowId,
    pending_authorization: Option<StopHandle>,
    connect_callback: Option<Callback>,
    disconnect_callback: Option<Callback>,
    /// Whether the server of the current connect flow joins the configured
    /// list once its connection is saved.
    configure_on_connect: bool,
    renewal_pending: bool,
    discovery_loading: bool,
    started: bool,
    /// Outstanding writes to the token and metadata stores.
    writes: JoinSet<()>,
}

impl fmt::Debug for ApplicationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationModel")
            .field("interface", &self.interface.kind())
            .field("network", &self.network.kind())
            .field("flow", &self.flow)
            .field("configured", &self.database.all_configured().len())
            .finish_non_exhaustive()
    }
}

impl ApplicationModel {
    pub fn new(services: Services, settings: ModelSettings) -> Self {
        let (dispatcher, inbox) = Dispatcher::new();
        let authorizer = Authorizer::new(
            settings.oauth.clone(),
            services.token_client.clone(),
            services.browser.clone(),
        );
        Self {
            services,
            settings,
            authorizer,
            interface: InterfaceState::default(),
            network: NetworkState::default(),
            interface_notifier: Notifier::new(),
            network_notifier: Notifier::new(),
            database: ServerDatabase::new(),
            tokens: TokenMap::new(),
            unsaved_tokens: HashSet::new(),
            metadata: MetadataMap::new(),
            server_info: HashMap::new(),
            validity: None,
            last_tick: None,
            dispatcher,
            inbox,
            flow: 0,
            pending_authorization: None,
            connect_callback: None,
            disconnect_callback: None,
            configure_on_connect: false,
            renewal_pending: false,
            discovery_loading: false,
            started: false,
            writes: JoinSet::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors and predicates
    // ─────────────────────────────────────────────────────────────────────────

    pub fn interface_state(&self) -> &InterfaceState {
        &self.interface
    }

    pub fn network_state(&self) -> &NetworkState {
        &self.network
    }

    pub fn database(&self) -> &ServerDatabase {
        &self.database
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn has_token(&self, server: &Server) -> bool {
        self.tokens.contains_key(server.login_url())
    }

    /// A handle background code can post messages with.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn session_validity(&self) -> Option<&SessionValidity> {
        self.validity.as_ref()
    }

    /// The server the user is working with, or the one the tunnel is for.
    pub fn current_server(&self) -> Option<&Server> {
        self.interface.server().or_else(|| self.network.server())
    }

    pub fn is_connected(&self) -> bool {
        self.network.kind() == NetworkStateKind::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.network.kind() == NetworkStateKind::Connecting
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(
            self.network.kind(),
            NetworkStateKind::Unconnected | NetworkStateKind::Disconnected
        )
    }

    pub fn is_oauth_started(&self) -> bool {
        self.interface.underlying().kind() == InterfaceStateKind::OAuthInProgress
    }

    pub fn is_search_active(&self) -> bool {
        self.interface.is_search()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subscribe_interface<F>(
        &mut self,
        kind: InterfaceStateKind,
        edge: Edge,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&InterfaceState) + Send + Sync + 'static,
    {
        self.interface_notifier.subscribe(kind, edge, handler)
    }

    pub fn subscribe_network<F>(&mut self, kind: NetworkStateKind, edge: Edge, handler: F) -> SubscriptionId
    where
        F: Fn(&NetworkState) + Send + Sync + 'static,
    {
        self.network_notifier.subscribe(kind, edge, handler)
    }

    pub fn unsubscribe_interface(&mut self, id: SubscriptionId) -> bool {
        self.interface_notifier.unsubscribe(id)
    }

    pub fn unsubscribe_network(&mut self, id: SubscriptionId) -> bool {
        self.network_notifier.unsubscribe(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Load persisted state and ask the backend for a surviving connection.
    ///
    /// Returns immediately; the machines leave `Initial` once the backend's
    /// answer is processed by the loop.
    pub fn start(&mut self) {
        if self.started {
            tracing::warn!("Model already started");
            return;
        }
        self.started = true;
        self.services
            .backend
            .attach(StatusReporter::new(self.dispatcher.clone()));

        let services = self.services.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let tokens = services.token_store.load_all().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Could not load stored tokens");
                TokenMap::new()
            });
            let metadata = services.metadata_store.load_all().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Could not load server metadata");
                MetadataMap::new()
            });
            let active = services.backend.active_connection().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Could not query the network backend");
                None
            });
            dispatcher.post(Message::Started(Box::new(Startup {
                tokens,
                metadata,
                active,
            })));
        });
    }

    /// Start connecting to `server`.
    ///
    /// `callback` receives the outcome once the flow reaches the connection
    /// status screen or ends in an error. It is dropped without being called
    /// when this returns an error. With `ensure_exists` the server is added
    /// to the configured list first; without it a server that is not
    /// configured yet stays out of the list (and the metadata store) after
    /// connecting.
    pub fn connect<F>(&mut self, server: Server, callback: F, ensure_exists: bool) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if ensure_exists && self.database.configured_by_login_url(server.login_url()).is_none() {
            self.add(server.clone());
        }
        tracing::info!(server = %server.login_url(), "Connecting");
        self.new_flow();
        self.apply_interface(InterfaceEvent::ConnectToServer { server })?;
        self.configure_on_connect = ensure_exists;
        if let Some(previous) = self.connect_callback.replace(Box::new(callback)) {
            previous(Err(CoreError::Cancelled));
        }
        Ok(())
    }

    /// Tear down the active connection.
    ///
    /// `callback` runs after the server was told about the disconnect.
    pub fn disconnect<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let server = self
            .network
            .server()
            .filter(|_| self.network.is_active())
            .cloned()
            .ok_or(CoreError::NotConnected)?;

        tracing::info!(server = %server.login_url(), "Disconnecting");
        self.new_flow();
        self.apply_network(NetworkEvent::Disconnect)?;
        if let Some(previous) = self.disconnect_callback.replace(Box::new(callback)) {
            previous(Err(CoreError::Cancelled));
        }
        if self.interface.underlying().kind() == InterfaceStateKind::ConnectionStatus {
            self.apply_interface(InterfaceEvent::Disconnect)?;
        } else {
            self.execute(Command::Disconnect { server });
        }
        Ok(())
    }

    /// Choose a profile. With `connect` the connection is (re)configured,
    /// otherwise the choice is only remembered for the next connect.
    pub fn set_profile(&mut self, profile: Profile, connect: bool) -> Result<()> {
        if connect {
            self.new_flow();
            return self.apply_interface(InterfaceEvent::SelectProfile { profile });
        }

        let server = self
            .interface
            .server()
            .cloned()
            .ok_or_else(|| self.invalid_interface("SelectProfile"))?;
        self.prefer_profile(&server, profile.id);
        Ok(())
    }

    /// Remember `profile_id` as the profile to use for `server`.
    pub fn prefer_profile(&mut self, server: &Server, profile_id: impl Into<String>) {
        let entry = self.metadata_entry(server);
        entry.profile_id = Some(profile_id.into());
        let entry = entry.clone();
        self.persist_metadata(entry);
    }

    pub fn select_location(&mut self, location: SecureInternetServer) -> Result<()> {
        self.new_flow();
        self.apply_interface(InterfaceEvent::SelectLocation { location })
    }

    pub fn search(&mut self, query: impl Into<String>) -> Result<()> {
        self.apply_interface(InterfaceEvent::UpdateSearch {
            query: query.into(),
        })
    }

    /// Obtain a fresh authorization for the current server.
    ///
    /// A running connection is torn down first and the authorization only
    /// starts once the server acknowledged the disconnect. The new
    /// configuration is activated when the flow completes.
    pub fn renew_session(&mut self) -> Result<()> {
        if self.interface.underlying().kind() != InterfaceStateKind::ConnectionStatus {
            return Err(self.invalid_interface("RenewSession"));
        }
        self.new_flow();
        match self.network.server().cloned() {
            Some(server) if self.network.is_active() => {
                tracing::info!(server = %server.login_url(), "Renewing session, disconnecting first");
                self.renewal_pending = true;
                self.apply_network(NetworkEvent::Disconnect)?;
                self.execute(Command::Disconnect { server });
                Ok(())
            }
            _ => self.apply_interface(InterfaceEvent::RenewSession),
        }
    }

    /// Add a server to the configured list.
    pub fn add(&mut self, server: Server) {
        tracing::info!(server = %server.login_url(), kind = %server.kind(), "Adding server");
        let entry = self.metadata_entry(&server).clone();
        self.persist_metadata(entry);
        self.database.add_configured(server);
        if self.interface.underlying().kind() == InterfaceStateKind::MainList {
            let result = self.apply_interface(InterfaceEvent::ServersChanged);
            self.report_interface(result);
        }
    }

    /// Forget a server with its token, metadata and stored configuration.
    pub fn remove(&mut self, server: &Server) -> Result<()> {
        if self.network.is_active()
            && self
                .network
                .server()
                .is_some_and(|s| s.login_url() == server.login_url())
        {
            self.apply_network(NetworkEvent::Disconnect)?;
            self.execute(Command::Disconnect {
                server: server.clone(),
            });
        }
        if self.interface.underlying().kind() == InterfaceStateKind::MainList {
            self.apply_interface(InterfaceEvent::RemoveServer {
                server: server.clone(),
            })
        } else {
            self.execute(Command::ForgetServer {
                server: server.clone(),
            });
            Ok(())
        }
    }

    pub fn cancel_oauth(&mut self) -> Result<()> {
        self.new_flow();
        self.apply_interface(InterfaceEvent::OAuthSetupCancel)
    }

    pub fn toggle_settings(&mut self) -> Result<()> {
        self.apply_interface(InterfaceEvent::ToggleSettings)
    }

    pub fn go_back(&mut self) -> Result<()> {
        self.new_flow();
        self.apply_interface(InterfaceEvent::Back)
    }

    pub fn retry(&mut self) -> Result<()> {
        self.new_flow();
        self.apply_interface(InterfaceEvent::Retry)
    }

    pub fn dismiss(&mut self) -> Result<()> {
        self.new_flow();
        self.apply_interface(InterfaceEvent::Dismiss)
    }

    /// Poll the session validity.
    ///
    /// Expires the connection once the validity ended and returns the
    /// notification times that came due since the previous tick.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        while self.writes.try_join_next().is_some() {}

        let since = self.last_tick.replace(now).unwrap_or(now);
        let Some(validity) = &self.validity else {
            return Vec::new();
        };

        let due = validity.notifications_due(since, now);
        if !due.is_empty() {
            tracing::info!(
                remaining_minutes = validity.remaining(now).num_minutes(),
                "Session will expire soon"
            );
        }

        if validity.is_expired(now) && self.network.is_active() {
            tracing::info!("Session expired");
            if let Err(e) = self.apply_network(NetworkEvent::CertificateExpired) {
                tracing::warn!(error = %e, "Could not expire the connection");
            }
        }
        due
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loop
    // ─────────────────────────────────────────────────────────────────────────

    /// Process messages and validity ticks until [`Message::Shutdown`].
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(Message::Shutdown) | None => {
                        tracing::debug!("Model loop stopping");
                        break;
                    }
                    Some(message) => self.handle(message),
                },
                _ = ticker.tick() => {
                    self.tick(Utc::now());
                }
            }
        }
    }

    /// Wait until every store write started so far has finished.
    pub async fn flush(&mut self) {
        while let Some(result) = self.writes.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Store write task failed");
            }
        }
    }

    /// Wait for one message and apply it. Returns `false` on shutdown.
    pub async fn process_next(&mut self) -> bool {
        match self.inbox.recv().await {
            Some(Message::Shutdown) | None => false,
            Some(message) => {
                self.handle(message);
                true
            }
        }
    }

    /// Process messages until `done` holds. Returns `false` on shutdown.
    pub async fn run_until<P>(&mut self, done: P) -> bool
    where
        P: Fn(&Self) -> bool,
    {
        while !done(self) {
            if !self.process_next().await {
                return false;
            }
        }
        true
    }

    fn handle(&mut self, message: Message) {
        if let Some(flow) = message.flow()
            && flow != self.flow
        {
            tracing::debug!(flow, current = self.flow, "Dropping result of an abandoned flow");
            if let Message::AuthorizationPending { stop, .. } = message {
                stop.stop();
            }
            return;
        }

        match message {
            Message::Started(startup) => self.on_started(*startup),
            Message::Network(event) => {
                if let Err(e) = self.apply_network(event) {
                    tracing::warn!(error = %e, "Ignoring backend status change");
                }
            }
            Message::AuthorizationPending { url, stop, .. } => {
                if self.is_oauth_started() {
                    self.pending_authorization = Some(stop);
                    self.interface_event(InterfaceEvent::AuthorizationStarted { url });
                }
            }
            Message::AuthorizationFinished { result, .. } => {
                self.pending_authorization = None;
                self.on_authorization_finished(result);
            }
            Message::AuthorizationSetupFailed { error, .. } => {
                self.interface_event(InterfaceEvent::OAuthSetupFailed { error });
            }
            Message::TokenRefreshed {
                login_url, token, ..
            } => {
                self.tokens.insert(login_url, token);
                self.interface_event(InterfaceEvent::TokenRefreshed);
            }
            Message::ProfilesFetched {
                base_url,
                info,
                profiles,
                ..
            } => {
                self.server_info.insert(base_url, info);
                self.interface_event(InterfaceEvent::ProfilesLoaded { profiles });
            }
            Message::ConnectionSaved { connection, .. } => self.on_connection_saved(connection),
            Message::AuthorizationExpired { .. } => {
                self.interface_event(InterfaceEvent::AuthorizationExpired);
            }
            Message::FlowFailed { error, .. } => {
                self.interface_event(InterfaceEvent::Failed { error });
            }
            Message::DiscoveryLoaded(result) => self.on_discovery_loaded(result),
            Message::ServerDisconnected { server } => self.on_server_disconnected(server),
            Message::Shutdown => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Message handlers
    // ─────────────────────────────────────────────────────────────────────────

    fn on_started(&mut self, startup: Startup) {
        self.tokens = startup.tokens;
        self.metadata = startup.metadata;
        for entry in self.metadata.values() {
            self.database.add_configured(entry.server.clone());
        }
        tracing::info!(
            configured = self.database.all_configured().len(),
            tokens = self.tokens.len(),
            "Loaded persisted state"
        );

        let active = startup
            .active
            .as_deref()
            .and_then(|url| self.metadata.get(url))
            .cloned();
        match active {
            Some(entry) => {
                tracing::info!(server = %entry.auth_url(), "Found an active connection");
                if let (Some(start), Some(end)) = (entry.validity_start, entry.validity_end) {
                    self.validity = Some(SessionValidity::from_config(start, end, &self.settings.session));
                }
                self.report_network(NetworkEvent::FoundActiveConnection {
                    server: entry.server.clone(),
                });
                self.interface_event(InterfaceEvent::FoundActiveConnection {
                    server: entry.server,
                });
            }
            None => {
                if let Some(url) = &startup.active {
                    tracing::warn!(server = %url, "Backend reports a connection for an unknown server");
                }
                self.report_network(NetworkEvent::NoPreviousConnectionFound);
                self.interface_event(InterfaceEvent::NoActiveConnectionFound);
            }
        }
    }

    fn on_authorization_finished(
        &mut self,
        result: std::result::Result<Option<AuthorizedSession>, OAuthError>,
    ) {
        match result {
            Ok(Some(session)) => {
                let Some(login_url) = self.interface.server().map(|s| s.login_url().to_string()) else {
                    tracing::warn!("Authorization finished without a server in the flow");
                    return;
                };
                tracing::info!(server = %login_url, "Authorization completed");
                self.tokens.insert(login_url.clone(), StoredToken::from(session));
                self.unsaved_tokens.insert(login_url);
                self.interface_event(InterfaceEvent::OAuthSetupSuccess);
            }
            Ok(None) => self.interface_event(InterfaceEvent::OAuthSetupCancel),
            Err(e) => {
                tracing::warn!(error = %e, "Authorization failed");
                self.interface_event(InterfaceEvent::OAuthSetupFailed { error: (&e).into() });
            }
        }
    }

    fn on_connection_saved(&mut self, connection: VpnConnection) {
        let now = Utc::now();
        let server = connection.server.clone();
        let login_url = server.login_url().to_string();
        tracing::info!(
            server = %login_url,
            profile = %connection.profile_id,
            protocol = %connection.protocol,
            expires = %connection.expires,
            "Connection configured"
        );

        let display_name = server.display_name(&self.settings.language, CountryNames::global());
        let token = self.tokens.get(&login_url).cloned();
        let entry = self.metadata_entry(&server);
        entry.server = server.clone();
        entry.display_name = display_name;
        entry.profile_id = Some(connection.profile_id.clone());
        entry.protocol = Some(connection.protocol);
        entry.country_code = server.country_code().map(str::to_string);
        entry.token_endpoint = token.as_ref().map(|t| t.token_endpoint.clone());
        entry.authorization_endpoint = token.as_ref().map(|t| t.authorization_endpoint.clone());
        entry.validity_start = Some(now);
        entry.validity_end = Some(connection.expires);
        let entry = entry.clone();
        if self.configure_on_connect || self.database.configured_by_login_url(&login_url).is_some() {
            self.persist_metadata(entry);
            self.database.add_configured(server.clone());
        } else {
            tracing::debug!(server = %login_url, "Connected server is not configured, metadata kept in memory");
        }

        self.validity = Some(SessionValidity::from_config(
            now,
            connection.expires,
            &self.settings.session,
        ));
        self.last_tick = Some(now);

        if self.network.is_active()
            && let Some(previous) = self.network.server().cloned()
        {
            self.report_network(NetworkEvent::Disconnect);
            if previous.login_url() != login_url {
                self.execute(Command::Disconnect { server: previous });
            }
        }
        self.report_network(NetworkEvent::StartNewConnection { server });
        self.interface_event(InterfaceEvent::ConnectionSaved);
    }

    fn on_discovery_loaded(&mut self, result: std::result::Result<DiscoverySnapshot, DiscoveryError>) {
        self.discovery_loading = false;
        match result {
            Ok(snapshot) => {
                tracing::info!(
                    institutes = snapshot.institutes.len(),
                    organizations = snapshot.organizations.len(),
                    locations = snapshot.locations.len(),
                    "Discovery refreshed"
                );
                self.database.replace_snapshot(snapshot);
                if self.interface.is_search() {
                    self.interface_event(InterfaceEvent::DiscoveryLoaded);
                }
            }
            Err(e) => {
                if e.is_signature_failure() {
                    tracing::warn!(error = %e, "Discovery documents rejected, keeping the previous lists");
                } else {
                    tracing::warn!(error = %e, "Could not refresh discovery");
                }
                if matches!(
                    self.interface.underlying().kind(),
                    InterfaceStateKind::PendingSearch | InterfaceStateKind::SearchResults
                ) {
                    self.interface_event(InterfaceEvent::DiscoveryFailed { error: (&e).into() });
                }
            }
        }
    }

    fn on_server_disconnected(&mut self, server: Server) {
        tracing::info!(server = %server.login_url(), "Disconnected");
        if let Some(callback) = self.disconnect_callback.take() {
            callback(Ok(()));
        }
        if self.renewal_pending {
            self.renewal_pending = false;
            let result = self.apply_interface(InterfaceEvent::RenewSession);
            self.report_interface(result);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Results of background tasks started before this call are dropped.
    fn new_flow(&mut self) {
        self.flow += 1;
    }

    fn apply_interface(&mut self, event: InterfaceEvent) -> Result<()> {
        let failure = match &event {
            InterfaceEvent::OAuthSetupFailed { error }
            | InterfaceEvent::DiscoveryFailed { error }
            | InterfaceEvent::Failed { error } => Some(error.clone()),
            _ => None,
        };
        let name = event.name();

        let ctx = TransitionContext {
            database: &self.database,
            tokens: &self.tokens,
            metadata: &self.metadata,
        };
        let transition = self.interface.clone().transition(event, &ctx)?;

        let old = std::mem::replace(&mut self.interface, transition.state);
        tracing::debug!(
            event = name,
            from = ?old.kind(),
            to = ?self.interface.kind(),
            commands = transition.commands.len(),
            "Interface transition"
        );
        self.interface_notifier.notify(&old, &self.interface);
        self.settle_connect(old.underlying().kind(), failure);

        for command in transition.commands {
            self.execute(command);
        }
        Ok(())
    }

    /// Apply an event produced by a background result.
    fn interface_event(&mut self, event: InterfaceEvent) {
        let result = self.apply_interface(event);
        self.report_interface(result);
    }

    fn report_interface(&self, result: Result<()>) {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Interface event ignored");
        }
    }

    fn apply_network(&mut self, event: NetworkEvent) -> Result<()> {
        let next = self
            .network
            .clone()
            .transition(event, self.services.backend.as_ref())?;
        let old = std::mem::replace(&mut self.network, next);
        tracing::debug!(from = ?old.kind(), to = ?self.network.kind(), "Network transition");
        self.network_notifier.notify(&old, &self.network);
        Ok(())
    }

    fn report_network(&mut self, event: NetworkEvent) {
        if let Err(e) = self.apply_network(event) {
            tracing::warn!(error = %e, "Network event ignored");
        }
    }

    /// Resolve a pending connect once the flow reached an outcome.
    fn settle_connect(&mut self, previous: InterfaceStateKind, failure: Option<UiError>) {
        if self.connect_callback.is_none() {
            return;
        }
        let outcome = match self.interface.underlying() {
            InterfaceState::ConnectionStatus { .. }
                if previous == InterfaceStateKind::ConfiguringConnection =>
            {
                Ok(())
            }
            InterfaceState::Error { error, .. } | InterfaceState::OAuthFailed { error, .. } => {
                Err(CoreError::Flow(error.clone()))
            }
            InterfaceState::MainList { .. }
            | InterfaceState::PendingSearch { .. }
            | InterfaceState::SearchResults { .. }
                if !is_home(previous) =>
            {
                Err(failure.map_or(CoreError::Cancelled, CoreError::Flow))
            }
            _ => return,
        };
        if let Some(callback) = self.connect_callback.take() {
            callback(outcome);
        }
    }

    fn invalid_interface(&self, event: &str) -> CoreError {
        InvalidTransition {
            machine: "interface",
            state: format!("{:?}", self.interface.kind()),
            event: event.to_string(),
        }
        .into()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    fn execute(&mut self, command: Command) {
        match command {
            Command::LoadDiscovery => self.load_discovery(),
            Command::StartAuthorization { server } => self.start_authorization(server),
            Command::CancelAuthorization => {
                if let Some(stop) = self.pending_authorization.take() {
                    stop.stop();
                }
            }
            Command::ClearToken { login_url } => self.clear_token(login_url),
            Command::RefreshToken { server } => self.refresh_token(server),
            Command::FetchProfiles { server } => self.fetch_profiles(server),
            Command::ActivateProfile { server, profile } => self.activate_profile(server, profile),
            Command::Disconnect { server } => self.disconnect_from_server(server),
            Command::ForgetServer { server } => self.forget(server),
        }
    }

    fn load_discovery(&mut self) {
        if self.discovery_loading {
            return;
        }
        self.discovery_loading = true;
        let discovery = self.services.discovery.clone();
        let previous = self.database.versions();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.post(Message::DiscoveryLoaded(discovery.fetch(previous).await));
        });
    }

    fn start_authorization(&mut self, server: Server) {
        let flow = self.flow;
        let authorizer = self.authorizer.clone();
        let api = self.services.server_api.clone();
        let dispatcher = self.dispatcher.clone();
        let login_url = server.login_url().to_string();

        tokio::spawn(async move {
            let info = match api.server_info(&login_url).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(server = %login_url, error = %e, "Could not resolve the authorization server");
                    dispatcher.post(Message::AuthorizationSetupFailed {
                        flow,
                        error: (&e).into(),
                    });
                    return;
                }
            };

            let finished = dispatcher.clone();
            let pending = authorizer
                .run_challenge_in_background(
                    &info.token_endpoint,
                    &info.authorization_endpoint,
                    move |result| finished.post(Message::AuthorizationFinished { flow, result }),
                )
                .await;
            match pending {
                Ok(pending) => dispatcher.post(Message::AuthorizationPending {
                    flow,
                    url: pending.authorization_url,
                    stop: pending.stop,
                }),
                Err(e) => dispatcher.post(Message::AuthorizationSetupFailed {
                    flow,
                    error: (&e).into(),
                }),
            }
        });
    }

    fn clear_token(&mut self, login_url: String) {
        self.tokens.remove(&login_url);
        self.unsaved_tokens.remove(&login_url);
        let store = self.services.token_store.clone();
        self.writes.spawn(async move {
            if let Err(e) = store.remove(&login_url).await {
                tracing::warn!(server = %login_url, error = %e, "Could not remove stored token");
            }
        });
    }

    /// Refresh once before use. Newly authorized tokens are persisted by
    /// this task so all writes for a server stay ordered.
    fn refresh_token(&mut self, server: Server) {
        let flow = self.flow;
        let login_url = server.login_url().to_string();
        let Some(stored) = self.tokens.get(&login_url).cloned() else {
            self.dispatcher.post(Message::AuthorizationExpired { flow });
            return;
        };
        let persist_original = self.unsaved_tokens.remove(&login_url);
        let client = self.services.token_client.clone();
        let store = self.services.token_store.clone();
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            match client.refresh_token(&stored.token_endpoint, &stored.token).await {
                Ok(token) => {
                    let refreshed = StoredToken { token, ..stored };
                    if let Err(e) = store.put(&login_url, refreshed.clone()).await {
                        tracing::warn!(server = %login_url, error = %e, "Could not store refreshed token");
                    }
                    dispatcher.post(Message::TokenRefreshed {
                        flow,
                        login_url,
                        token: refreshed,
                    });
                }
                Err(e) if e.is_invalid_grant() => {
                    tracing::info!(server = %login_url, "Stored grant rejected, authorizing again");
                    dispatcher.post(Message::AuthorizationExpired { flow });
                }
                Err(e) => {
                    tracing::warn!(server = %login_url, error = %e, "Token refresh failed");
                    if persist_original && let Err(e) = store.put(&login_url, stored).await {
                        tracing::warn!(server = %login_url, error = %e, "Could not store token");
                    }
                    dispatcher.post(Message::FlowFailed {
                        flow,
                        error: (&e).into(),
                    });
                }
            }
        });
    }

    fn fetch_profiles(&mut self, server: Server) {
        let flow = self.flow;
        let Some(access_token) = self.access_token(&server) else {
            self.dispatcher.post(Message::AuthorizationExpired { flow });
            return;
        };
        let base_url = server.base_url().to_string();
        let cached = self.server_info.get(&base_url).cloned();
        let api = self.services.server_api.clone();
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            let result = async {
                let info = match cached {
                    Some(info) => info,
                    None => api.server_info(&base_url).await?,
                };
                let profiles = api.profiles(&info, &access_token).await?;
                Ok::<_, DiscoveryError>((info, profiles))
            }
            .await;

            match result {
                Ok((info, profiles)) => {
                    tracing::debug!(server = %base_url, profiles = profiles.len(), "Fetched profiles");
                    dispatcher.post(Message::ProfilesFetched {
                        flow,
                        base_url,
                        info,
                        profiles,
                    });
                }
                Err(e) => post_api_failure(&dispatcher, flow, &e),
            }
        });
    }

    /// Obtain a configuration, hand it to the backend and report back.
    fn activate_profile(&mut self, server: Server, profile: Profile) {
        let flow = self.flow;
        let Some(access_token) = self.access_token(&server) else {
            self.dispatcher.post(Message::AuthorizationExpired { flow });
            return;
        };
        let cached = self.server_info.get(server.base_url()).cloned();
        let prefer_tcp = self.settings.prefer_tcp;
        let api = self.services.server_api.clone();
        let backend = self.services.backend.clone();
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            let keypair = profile
                .supports(Protocol::WireGuard)
                .then(WireGuardKeypair::generate);
            let request = ConnectRequest {
                profile_id: profile.id.clone(),
                public_key: keypair.as_ref().map(WireGuardKeypair::public_key),
                prefer_tcp,
            };

            let result = async {
                let info = match cached {
                    Some(info) => info,
                    None => api.server_info(server.base_url()).await?,
                };
                api.connect(&info, &access_token, &request).await
            }
            .await;
            let config = match result {
                Ok(config) => config,
                Err(e) => {
                    post_api_failure(&dispatcher, flow, &e);
                    return;
                }
            };
            let config = match &keypair {
                Some(keypair) => config.with_private_key(&keypair.private_key()),
                None => config,
            };

            let connection = VpnConnection {
                server,
                profile_id: profile.id,
                protocol: config.protocol,
                config: config.config,
                expires: config.expires,
            };
            match backend.save(&connection).await {
                Ok(()) => dispatcher.post(Message::ConnectionSaved { flow, connection }),
                Err(e) => {
                    tracing::warn!(error = %e, "Backend could not store the connection");
                    dispatcher.post(Message::FlowFailed {
                        flow,
                        error: (&e).into(),
                    });
                }
            }
        });
    }

    /// Tell the server the configuration is no longer in use.
    fn disconnect_from_server(&mut self, server: Server) {
        let access_token = self.access_token(&server);
        let cached = self.server_info.get(server.base_url()).cloned();
        let api = self.services.server_api.clone();
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            if let Some(access_token) = access_token {
                let result = async {
                    let info = match cached {
                        Some(info) => info,
                        None => api.server_info(server.base_url()).await?,
                    };
                    api.disconnect(&info, &access_token).await
                }
                .await;
                if let Err(e) = result {
                    tracing::warn!(server = %server.login_url(), error = %e, "Server disconnect call failed");
                }
            }
            dispatcher.post(Message::ServerDisconnected { server });
        });
    }

    fn forget(&mut self, server: Server) {
        let login_url = server.login_url().to_string();
        tracing::info!(server = %login_url, "Forgetting server");
        self.database.remove_configured(&login_url);
        self.tokens.remove(&login_url);
        self.unsaved_tokens.remove(&login_url);
        self.metadata.remove(&login_url);
        self.server_info.remove(server.base_url());

        let services = self.services.clone();
        self.writes.spawn(async move {
            if let Err(e) = services.token_store.remove(&login_url).await {
                tracing::warn!(server = %login_url, error = %e, "Could not remove token");
            }
            if let Err(e) = services.metadata_store.remove(&login_url).await {
                tracing::warn!(server = %login_url, error = %e, "Could not remove metadata");
            }
            if let Err(e) = services.backend.remove(&server).await {
                tracing::warn!(server = %login_url, error = %e, "Backend could not remove the connection");
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn access_token(&self, server: &Server) -> Option<String> {
        self.tokens
            .get(server.login_url())
            .map(|t| t.token.access_token.clone())
    }

    fn metadata_entry(&mut self, server: &Server) -> &mut ServerMetadata {
        let display_name = server.display_name(&self.settings.language, CountryNames::global());
        self.metadata
            .entry(server.login_url().to_string())
            .or_insert_with(|| ServerMetadata::new(server.clone(), display_name))
    }

    fn persist_metadata(&mut self, entry: ServerMetadata) {
        let store = self.services.metadata_store.clone();
        self.writes.spawn(async move {
            if let Err(e) = store.put(entry).await {
                tracing::warn!(error = %e, "Could not store server metadata");
            }
        });
    }
}

fn is_home(kind: InterfaceStateKind) -> bool {
    matches!(
        kind,
        InterfaceStateKind::MainList
            | InterfaceStateKind::PendingSearch
            | InterfaceStateKind::SearchResults
    )
}

fn post_api_failure(dispatcher: &Dispatcher, flow: FlowId, error: &DiscoveryError) {
    if error.is_auth_error() {
        tracing::info!("Server rejected the access token");
        dispatcher.post(Message::AuthorizationExpired { flow });
    } else {
        tracing::warn!(error = %error, "Server request failed");
        dispatcher.post(Message::FlowFailed {
            flow,
            error: UiError::from(error),
        });
    }
}
