//! VPN connection status machine and the network backend seam.
//!
//! [`NetworkState::transition`] is the only place that calls
//! [`NetworkBackend::activate`] and [`NetworkBackend::deactivate`].

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eduvpn_discovery::{Protocol, Server};

use crate::dispatch::StatusReporter;
use crate::error::{InvalidTransition, Result};
use crate::notify::Observable;

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

/// A configuration ready to be handed to the system.
#[derive(Clone, PartialEq, Eq)]
pub struct VpnConnection {
    pub server: Server,
    pub profile_id: String,
    pub protocol: Protocol,
    pub config: String,
    pub expires: DateTime<Utc>,
}

impl fmt::Debug for VpnConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpnConnection")
            .field("server", &self.server.login_url())
            .field("profile_id", &self.profile_id)
            .field("protocol", &self.protocol)
            .field("config", &"[redacted]")
            .field("expires", &self.expires)
            .finish()
    }
}

/// The external service that actually establishes tunnels.
///
/// `activate` and `deactivate` run on the main loop and must return
/// immediately; progress is reported through the attached
/// [`StatusReporter`].
#[async_trait]
pub trait NetworkBackend: Send + Sync + fmt::Debug {
    /// Receive the reporter for asynchronous status changes.
    fn attach(&self, reporter: StatusReporter);

    /// Login URL of a connection left active by an earlier run.
    async fn active_connection(&self) -> Result<Option<String>>;

    /// Store a configuration so it can be activated.
    async fn save(&self, connection: &VpnConnection) -> Result<()>;

    /// Drop any stored configuration for `server`.
    async fn remove(&self, server: &Server) -> Result<()>;

    /// Start bringing up the stored connection for `server`.
    fn activate(&self, server: &Server);

    /// Start tearing down the connection for `server`.
    fn deactivate(&self, server: &Server);
}

// ─────────────────────────────────────────────────────────────────────────────
// States and events
// ─────────────────────────────────────────────────────────────────────────────

/// Status of the VPN tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkState {
    #[default]
    Initial,
    Unconnected,
    Connecting { server: Server },
    Connected { server: Server },
    Disconnected { server: Server },
    CertificateExpired { server: Server },
    ConnectionError { server: Server, description: String },
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkStateKind {
    Initial,
    Unconnected,
    Connecting,
    Connected,
    Disconnected,
    CertificateExpired,
    ConnectionError,
    Unknown,
}

/// Inputs of the network machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    FoundActiveConnection { server: Server },
    NoPreviousConnectionFound,
    StartNewConnection { server: Server },
    Reconnect,
    ConnectionEstablished,
    Disconnect,
    /// The backend reports the tunnel went down.
    ConnectionLost,
    CertificateExpired,
    ConnectionFailed { description: String },
    SetUnknown,
}

impl NetworkEvent {
    fn name(&self) -> &'static str {
        match self {
            NetworkEvent::FoundActiveConnection { .. } => "FoundActiveConnection",
            NetworkEvent::NoPreviousConnectionFound => "NoPreviousConnectionFound",
            NetworkEvent::StartNewConnection { .. } => "StartNewConnection",
            NetworkEvent::Reconnect => "Reconnect",
            NetworkEvent::ConnectionEstablished => "ConnectionEstablished",
            NetworkEvent::Disconnect => "Disconnect",
            NetworkEvent::ConnectionLost => "ConnectionLost",
            NetworkEvent::CertificateExpired => "CertificateExpired",
            NetworkEvent::ConnectionFailed { .. } => "ConnectionFailed",
            NetworkEvent::SetUnknown => "SetUnknown",
        }
    }
}

impl Observable for NetworkState {
    type Kind = NetworkStateKind;

    fn kind(&self) -> NetworkStateKind {
        match self {
            NetworkState::Initial => NetworkStateKind::Initial,
            NetworkState::Unconnected => NetworkStateKind::Unconnected,
            NetworkState::Connecting { .. } => NetworkStateKind::Connecting,
            NetworkState::Connected { .. } => NetworkStateKind::Connected,
            NetworkState::Disconnected { .. } => NetworkStateKind::Disconnected,
            NetworkState::CertificateExpired { .. } => NetworkStateKind::CertificateExpired,
            NetworkState::ConnectionError { .. } => NetworkStateKind::ConnectionError,
            NetworkState::Unknown => NetworkStateKind::Unknown,
        }
    }
}

impl NetworkState {
    /// Apply `event`, calling the backend where the transition requires it.
    pub fn transition(
        self,
        event: NetworkEvent,
        backend: &dyn NetworkBackend,
    ) -> std::result::Result<NetworkState, InvalidTransition> {
        use NetworkEvent as E;
        use NetworkState as S;

        let next = match (self, event) {
            (_, E::SetUnknown) => S::Unknown,

            (S::Initial | S::Unknown, E::FoundActiveConnection { server }) => S::Connected { server },
            (S::Initial | S::Unknown, E::NoPreviousConnectionFound) => S::Unconnected,

            (
                S::Unconnected
                | S::Disconnected { .. }
                | S::CertificateExpired { .. }
                | S::ConnectionError { .. },
                E::StartNewConnection { server },
            ) => {
                backend.activate(&server);
                S::Connecting { server }
            }
            (S::Disconnected { server } | S::ConnectionError { server, .. }, E::Reconnect) => {
                backend.activate(&server);
                S::Connecting { server }
            }

            (S::Connecting { server } | S::Connected { server }, E::ConnectionEstablished) => {
                S::Connected { server }
            }

            (S::Connecting { server } | S::Connected { server }, E::Disconnect) => {
                backend.deactivate(&server);
                S::Disconnected { server }
            }
            (
                S::Connecting { server } | S::Connected { server } | S::Disconnected { server },
                E::ConnectionLost,
            ) => S::Disconnected { server },

            (S::Connecting { server } | S::Connected { server }, E::CertificateExpired) => {
                backend.deactivate(&server);
                S::CertificateExpired { server }
            }

            (S::Connecting { server } | S::Connected { server }, E::ConnectionFailed { description }) => {
                S::ConnectionError { server, description }
            }

            (state, event) => {
                return Err(InvalidTransition {
                    machine: "network",
                    state: format!("{:?}", state.kind()),
                    event: event.name().to_string(),
                });
            }
        };
        Ok(next)
    }

    /// The server this state refers to, if any.
    pub fn server(&self) -> Option<&Server> {
        match self {
            NetworkState::Connecting { server }
            | NetworkState::Connected { server }
            | NetworkState::Disconnected { server }
            | NetworkState::CertificateExpired { server }
            | NetworkState::ConnectionError { server, .. } => Some(server),
            NetworkState::Initial | NetworkState::Unconnected | NetworkState::Unknown => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            NetworkState::Connecting { .. } | NetworkState::Connected { .. }
        )
    }
}
