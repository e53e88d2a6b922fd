//! Top-level user flow.
//!
//! Each state carries only what its screen needs. A transition consumes the
//! current state and returns the next one plus the [`Command`]s the model
//! must run in the background; transitions never perform I/O themselves.

use eduvpn_discovery::{Profile, SecureInternetServer, Server, ServerDatabase};
use eduvpn_oauth::TokenMap;

use crate::error::{ErrorKind, InvalidTransition, UiError};
use crate::metadata::MetadataMap;
use crate::notify::Observable;

// ─────────────────────────────────────────────────────────────────────────────
// States
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InterfaceState {
    #[default]
    Initial,
    /// Configured servers.
    MainList { servers: Vec<Server> },
    /// A search waiting for discovery data.
    PendingSearch { query: String },
    /// Matches from the discovery snapshot. `refresh_error` is set when the
    /// lists could not be refreshed and the results come from an older
    /// snapshot.
    SearchResults {
        query: String,
        results: Vec<Server>,
        refresh_error: Option<UiError>,
    },
    /// The query looks like a server address.
    CustomServerEntry { query: String, server: Server },
    /// Refreshing the token, resolving the location or fetching profiles.
    LoadingServerInformation { server: Server },
    OAuthInProgress {
        server: Server,
        authorization_url: Option<String>,
    },
    OAuthFailed { server: Server, error: UiError },
    ChooseSecureInternetLocation {
        server: Server,
        locations: Vec<SecureInternetServer>,
    },
    ChooseProfile { server: Server, profiles: Vec<Profile> },
    /// Fetching the configuration and handing it to the backend.
    ConfiguringConnection { server: Server, profile: Profile },
    ConnectionStatus {
        server: Server,
        profile: Option<Profile>,
    },
    SettingsOverlay { previous: Box<InterfaceState> },
    Error {
        error: UiError,
        previous: Box<InterfaceState>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceStateKind {
    Initial,
    MainList,
    PendingSearch,
    SearchResults,
    CustomServerEntry,
    LoadingServerInformation,
    OAuthInProgress,
    OAuthFailed,
    ChooseSecureInternetLocation,
    ChooseProfile,
    ConfiguringConnection,
    ConnectionStatus,
    SettingsOverlay,
    Error,
}

impl Observable for InterfaceState {
    type Kind = InterfaceStateKind;

    fn kind(&self) -> InterfaceStateKind {
        use InterfaceState as S;
        use InterfaceStateKind as K;
        match self {
            S::Initial => K::Initial,
            S::MainList { .. } => K::MainList,
            S::PendingSearch { .. } => K::PendingSearch,
            S::SearchResults { .. } => K::SearchResults,
            S::CustomServerEntry { .. } => K::CustomServerEntry,
            S::LoadingServerInformation { .. } => K::LoadingServerInformation,
            S::OAuthInProgress { .. } => K::OAuthInProgress,
            S::OAuthFailed { .. } => K::OAuthFailed,
            S::ChooseSecureInternetLocation { .. } => K::ChooseSecureInternetLocation,
            S::ChooseProfile { .. } => K::ChooseProfile,
            S::ConfiguringConnection { .. } => K::ConfiguringConnection,
            S::ConnectionStatus { .. } => K::ConnectionStatus,
            S::SettingsOverlay { .. } => K::SettingsOverlay,
            S::Error { .. } => K::Error,
        }
    }
}

impl InterfaceState {
    /// The server the current flow is about, looking through overlays.
    pub fn server(&self) -> Option<&Server> {
        use InterfaceState as S;
        match self {
            S::CustomServerEntry { server, .. }
            | S::LoadingServerInformation { server }
            | S::OAuthInProgress { server, .. }
            | S::OAuthFailed { server, .. }
            | S::ChooseSecureInternetLocation { server, .. }
            | S::ChooseProfile { server, .. }
            | S::ConfiguringConnection { server, .. }
            | S::ConnectionStatus { server, .. } => Some(server),
            S::SettingsOverlay { previous } => previous.server(),
            _ => None,
        }
    }

    /// The state below any settings overlay.
    pub fn underlying(&self) -> &InterfaceState {
        match self {
            InterfaceState::SettingsOverlay { previous } => previous,
            other => other,
        }
    }

    pub fn is_search(&self) -> bool {
        matches!(
            self.underlying(),
            InterfaceState::PendingSearch { .. }
                | InterfaceState::SearchResults { .. }
                | InterfaceState::CustomServerEntry { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events and commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceEvent {
    FoundActiveConnection { server: Server },
    NoActiveConnectionFound,
    /// The configured servers changed.
    ServersChanged,
    UpdateSearch { query: String },
    DiscoveryLoaded,
    DiscoveryFailed { error: UiError },
    ConnectToServer { server: Server },
    AuthorizationStarted { url: String },
    OAuthSetupSuccess,
    OAuthSetupCancel,
    OAuthSetupFailed { error: UiError },
    TokenRefreshed,
    /// The stored grant is no longer accepted; a new authorization is needed.
    AuthorizationExpired,
    ProfilesLoaded { profiles: Vec<Profile> },
    SelectLocation { location: SecureInternetServer },
    SelectProfile { profile: Profile },
    /// The backend stored the configuration.
    ConnectionSaved,
    RemoveServer { server: Server },
    Disconnect,
    RenewSession,
    ToggleSettings,
    Back,
    Retry,
    Dismiss,
    Failed { error: UiError },
}

impl InterfaceEvent {
    pub fn name(&self) -> &'static str {
        use InterfaceEvent as E;
        match self {
            E::FoundActiveConnection { .. } => "FoundActiveConnection",
            E::NoActiveConnectionFound => "NoActiveConnectionFound",
            E::ServersChanged => "ServersChanged",
            E::UpdateSearch { .. } => "UpdateSearch",
            E::DiscoveryLoaded => "DiscoveryLoaded",
            E::DiscoveryFailed { .. } => "DiscoveryFailed",
            E::ConnectToServer { .. } => "ConnectToServer",
            E::AuthorizationStarted { .. } => "AuthorizationStarted",
            E::OAuthSetupSuccess => "OAuthSetupSuccess",
            E::OAuthSetupCancel => "OAuthSetupCancel",
            E::OAuthSetupFailed { .. } => "OAuthSetupFailed",
            E::TokenRefreshed => "TokenRefreshed",
            E::AuthorizationExpired => "AuthorizationExpired",
            E::ProfilesLoaded { .. } => "ProfilesLoaded",
            E::SelectLocation { .. } => "SelectLocation",
            E::SelectProfile { .. } => "SelectProfile",
            E::ConnectionSaved => "ConnectionSaved",
            E::RemoveServer { .. } => "RemoveServer",
            E::Disconnect => "Disconnect",
            E::RenewSession => "RenewSession",
            E::ToggleSettings => "ToggleSettings",
            E::Back => "Back",
            E::Retry => "Retry",
            E::Dismiss => "Dismiss",
            E::Failed { .. } => "Failed",
        }
    }
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LoadDiscovery,
    StartAuthorization { server: Server },
    CancelAuthorization,
    ClearToken { login_url: String },
    RefreshToken { server: Server },
    FetchProfiles { server: Server },
    ActivateProfile { server: Server, profile: Profile },
    Disconnect { server: Server },
    ForgetServer { server: Server },
}

/// Result of a successful transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: InterfaceState,
    pub commands: Vec<Command>,
}

impl Transition {
    fn to(state: InterfaceState) -> Self {
        Self {
            state,
            commands: Vec::new(),
        }
    }

    fn with(state: InterfaceState, commands: Vec<Command>) -> Self {
        Self { state, commands }
    }
}

/// Read-only view of model data transitions may consult.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub database: &'a ServerDatabase,
    pub tokens: &'a TokenMap,
    pub metadata: &'a MetadataMap,
}

impl TransitionContext<'_> {
    pub fn has_token(&self, server: &Server) -> bool {
        self.tokens.contains_key(server.login_url())
    }

    /// Profile chosen for this server earlier.
    pub fn preferred_profile(&self, server: &Server) -> Option<&str> {
        self.metadata
            .get(server.login_url())
            .and_then(|m| m.profile_id.as_deref())
    }

    fn main_list(&self) -> InterfaceState {
        InterfaceState::MainList {
            servers: self.database.all_configured().to_vec(),
        }
    }

    /// Where the user lands when nothing is going on.
    fn home(&self) -> Transition {
        if self.database.has_configured() {
            return Transition::to(self.main_list());
        }
        let state = if self.database.has_discovery() {
            InterfaceState::SearchResults {
                query: String::new(),
                results: self.database.search_predefined("").collect(),
                refresh_error: None,
            }
        } else {
            InterfaceState::PendingSearch {
                query: String::new(),
            }
        };
        Transition::with(state, vec![Command::LoadDiscovery])
    }

    fn search(&self, query: String) -> Transition {
        if query.trim().is_empty() && self.database.has_configured() {
            return Transition::to(self.main_list());
        }
        if looks_like_address(&query) {
            let server = self
                .database
                .search_custom(&query)
                .next()
                .unwrap_or_else(|| Server::Custom(eduvpn_discovery::CustomServer::from_input(&query)));
            return Transition::to(InterfaceState::CustomServerEntry { query, server });
        }
        if !self.database.has_discovery() {
            return Transition::with(
                InterfaceState::PendingSearch { query },
                vec![Command::LoadDiscovery],
            );
        }
        let results = self.database.search_predefined(&query).collect();
        Transition::to(InterfaceState::SearchResults {
            query,
            results,
            refresh_error: None,
        })
    }

    fn start_connection(&self, server: Server) -> Transition {
        if self.has_token(&server) {
            Transition::with(
                InterfaceState::LoadingServerInformation {
                    server: server.clone(),
                },
                vec![Command::RefreshToken { server }],
            )
        } else {
            authorize(server, Vec::new())
        }
    }

    /// Resolve the secure internet location, skipping the choice when
    /// there is only one.
    fn resolve_location(&self, server: Server) -> Transition {
        let Server::Organization(org) = &server else {
            return fetch_profiles(server);
        };
        let mut locations = self.database.locations_for(org);
        match locations.len() {
            0 => failed(
                UiError::new(ErrorKind::Server, "No secure internet locations available"),
                InterfaceState::LoadingServerInformation { server },
            ),
            1 => fetch_profiles(Server::SecureInternet(locations.remove(0))),
            _ => Transition::to(InterfaceState::ChooseSecureInternetLocation { server, locations }),
        }
    }

    /// Pick a profile, skipping the choice when there is only one or a
    /// previously selected one is still offered.
    fn resolve_profile(&self, server: Server, mut profiles: Vec<Profile>) -> Transition {
        if let Some(preferred) = self.preferred_profile(&server)
            && let Some(index) = profiles.iter().position(|p| p.id == preferred)
        {
            return configure(server, profiles.swap_remove(index));
        }
        match profiles.len() {
            0 => failed(
                UiError::new(ErrorKind::Server, "The server offers no profiles"),
                InterfaceState::LoadingServerInformation { server },
            ),
            1 => configure(server, profiles.remove(0)),
            _ => Transition::to(InterfaceState::ChooseProfile { server, profiles }),
        }
    }
}

fn authorize(server: Server, mut commands: Vec<Command>) -> Transition {
    commands.push(Command::StartAuthorization {
        server: server.clone(),
    });
    Transition::with(
        InterfaceState::OAuthInProgress {
            server,
            authorization_url: None,
        },
        commands,
    )
}

fn fetch_profiles(server: Server) -> Transition {
    Transition::with(
        InterfaceState::LoadingServerInformation {
            server: server.clone(),
        },
        vec![Command::FetchProfiles { server }],
    )
}

fn configure(server: Server, profile: Profile) -> Transition {
    Transition::with(
        InterfaceState::ConfiguringConnection {
            server: server.clone(),
            profile: profile.clone(),
        },
        vec![Command::ActivateProfile { server, profile }],
    )
}

fn failed(error: UiError, previous: InterfaceState) -> Transition {
    Transition::to(InterfaceState::Error {
        error,
        previous: Box::new(previous),
    })
}

/// Whether a search query should be treated as a server address.
fn looks_like_address(query: &str) -> bool {
    let q = query.trim();
    q.contains("://") || (q.contains('.') && !q.contains(char::is_whitespace) && !q.ends_with('.'))
}

// ─────────────────────────────────────────────────────────────────────────────
// Transition function
// ─────────────────────────────────────────────────────────────────────────────

impl InterfaceState {
    pub fn transition(
        self,
        event: InterfaceEvent,
        ctx: &TransitionContext<'_>,
    ) -> Result<Transition, InvalidTransition> {
        use InterfaceEvent as E;
        use InterfaceState as S;

        let transition = match (self, event) {
            // Settings wrap any state once; everything else goes to the
            // wrapped state so background results are not lost.
            (S::SettingsOverlay { previous }, E::ToggleSettings | E::Back) => Transition::to(*previous),
            (S::SettingsOverlay { previous }, event) => {
                let inner = previous.transition(event, ctx)?;
                Transition::with(
                    S::SettingsOverlay {
                        previous: Box::new(inner.state),
                    },
                    inner.commands,
                )
            }
            (state, E::ToggleSettings) => Transition::to(S::SettingsOverlay {
                previous: Box::new(state),
            }),

            // Startup
            (S::Initial, E::FoundActiveConnection { server }) => {
                Transition::to(S::ConnectionStatus {
                    server,
                    profile: None,
                })
            }
            (S::Initial, E::NoActiveConnectionFound) => ctx.home(),

            // Server lists and search
            (S::MainList { .. }, E::ServersChanged) => Transition::to(ctx.main_list()),
            (S::MainList { .. }, E::RemoveServer { server }) => Transition::with(
                S::MainList {
                    servers: ctx
                        .database
                        .all_configured()
                        .iter()
                        .filter(|s| s.login_url() != server.login_url())
                        .cloned()
                        .collect(),
                },
                vec![Command::ForgetServer { server }],
            ),
            (
                S::MainList { .. }
                | S::PendingSearch { .. }
                | S::SearchResults { .. }
                | S::CustomServerEntry { .. },
                E::UpdateSearch { query },
            ) => ctx.search(query),
            (S::PendingSearch { query } | S::SearchResults { query, .. }, E::DiscoveryLoaded) => {
                ctx.search(query)
            }
            (state @ S::CustomServerEntry { .. }, E::DiscoveryLoaded) => Transition::to(state),
            (state @ S::PendingSearch { .. }, E::DiscoveryFailed { error }) => failed(error, state),
            (S::SearchResults { query, results, .. }, E::DiscoveryFailed { error }) => {
                Transition::to(S::SearchResults {
                    query,
                    results,
                    refresh_error: Some(error),
                })
            }
            (
                S::PendingSearch { .. } | S::SearchResults { .. } | S::CustomServerEntry { .. },
                E::Back,
            ) => Transition::to(ctx.main_list()),

            // Starting a connection
            (
                S::MainList { .. }
                | S::SearchResults { .. }
                | S::CustomServerEntry { .. }
                | S::ConnectionStatus { .. },
                E::ConnectToServer { server },
            ) => ctx.start_connection(server),

            // Authorization
            (S::OAuthInProgress { server, .. }, E::AuthorizationStarted { url }) => {
                Transition::to(S::OAuthInProgress {
                    server,
                    authorization_url: Some(url),
                })
            }
            (S::OAuthInProgress { server, .. }, E::OAuthSetupSuccess) => Transition::with(
                S::LoadingServerInformation {
                    server: server.clone(),
                },
                vec![Command::RefreshToken { server }],
            ),
            (S::OAuthInProgress { .. }, E::OAuthSetupCancel) => {
                let mut home = ctx.home();
                home.commands.insert(0, Command::CancelAuthorization);
                home
            }
            (S::OAuthInProgress { .. }, E::OAuthSetupFailed { error })
                if error.kind == ErrorKind::Protocol =>
            {
                ctx.home()
            }
            (S::OAuthInProgress { server, .. }, E::OAuthSetupFailed { error }) => {
                Transition::to(S::OAuthFailed { server, error })
            }
            (S::OAuthFailed { server, .. }, E::Retry) => authorize(server, Vec::new()),
            (S::OAuthFailed { .. }, E::Dismiss | E::Back) => ctx.home(),

            // Token refresh, location and profile resolution
            (S::LoadingServerInformation { server }, E::TokenRefreshed) => {
                ctx.resolve_location(server)
            }
            (S::LoadingServerInformation { server }, E::AuthorizationExpired) => {
                let login_url = server.login_url().to_string();
                authorize(server, vec![Command::ClearToken { login_url }])
            }
            (S::LoadingServerInformation { server }, E::ProfilesLoaded { profiles }) => {
                ctx.resolve_profile(server, profiles)
            }
            (state @ S::LoadingServerInformation { .. }, E::Failed { error }) => failed(error, state),

            (S::ChooseSecureInternetLocation { .. }, E::SelectLocation { location }) => {
                fetch_profiles(Server::SecureInternet(location))
            }
            (S::ChooseProfile { server, .. }, E::SelectProfile { profile })
            | (S::ConnectionStatus { server, .. }, E::SelectProfile { profile }) => {
                configure(server, profile)
            }
            (
                S::ChooseSecureInternetLocation { .. }
                | S::ChooseProfile { .. }
                | S::LoadingServerInformation { .. },
                E::Back,
            ) => ctx.home(),

            // Connection
            (S::ConfiguringConnection { server, profile }, E::ConnectionSaved) => {
                Transition::to(S::ConnectionStatus {
                    server,
                    profile: Some(profile),
                })
            }
            (state @ S::ConfiguringConnection { .. }, E::Failed { error }) => failed(error, state),
            (S::ConfiguringConnection { server, .. }, E::AuthorizationExpired) => {
                let login_url = server.login_url().to_string();
                authorize(server, vec![Command::ClearToken { login_url }])
            }
            (S::ConnectionStatus { server, .. }, E::Disconnect) => {
                let mut home = Transition::to(ctx.main_list());
                home.commands.push(Command::Disconnect { server });
                home
            }
            (S::ConnectionStatus { server, .. }, E::RenewSession) => {
                let login_url = server.login_url().to_string();
                authorize(server, vec![Command::ClearToken { login_url }])
            }
            (S::ConnectionStatus { .. }, E::Back) => Transition::to(ctx.main_list()),

            // Errors. A failed search retries the lookup.
            (S::Error { previous, .. }, E::Retry) => match *previous {
                S::PendingSearch { query } => ctx.search(query),
                _ => Transition::to(ctx.main_list()),
            },
            (S::Error { .. }, E::Dismiss | E::Back) => Transition::to(ctx.main_list()),

            (state, event) => {
                return Err(InvalidTransition {
                    machine: "interface",
                    state: format!("{:?}", state.kind()),
                    event: event.name().to_string(),
                });
            }
        };
        Ok(transition)
    }
}
