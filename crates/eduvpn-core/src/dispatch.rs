//! Main-loop message queue.
//!
//! Background tasks never touch the state machines. They post a
//! [`Message`] through a [`Dispatcher`] and the model applies it on its own
//! loop, so transitions of each machine are strictly serialized.

use eduvpn_discovery::{DiscoveryError, DiscoverySnapshot, Profile, Server, ServerInfo};
use eduvpn_oauth::{AuthorizedSession, OAuthError, StopHandle, StoredToken, TokenMap};
use tokio::sync::mpsc;

use crate::error::UiError;
use crate::metadata::MetadataMap;
use crate::network::{NetworkEvent, VpnConnection};

/// Identifies the user flow a background result belongs to. Results of an
/// abandoned flow are dropped.
pub type FlowId = u64;

/// What startup loaded and what the backend reported.
#[derive(Debug, Default)]
pub struct Startup {
    pub tokens: TokenMap,
    pub metadata: MetadataMap,
    /// Login URL of a connection the backend still has up.
    pub active: Option<String>,
}

#[derive(Debug)]
pub enum Message {
    Started(Box<Startup>),
    /// Status change reported by the network backend.
    Network(NetworkEvent),
    /// The authorization page was opened and the listener is waiting.
    AuthorizationPending {
        flow: FlowId,
        url: String,
        stop: StopHandle,
    },
    /// The listener returned: a session, a cancel (`None`), or an error.
    AuthorizationFinished {
        flow: FlowId,
        result: Result<Option<AuthorizedSession>, OAuthError>,
    },
    /// Setting up the authorization failed before the browser was opened.
    AuthorizationSetupFailed { flow: FlowId, error: UiError },
    TokenRefreshed {
        flow: FlowId,
        login_url: String,
        token: StoredToken,
    },
    ProfilesFetched {
        flow: FlowId,
        base_url: String,
        info: ServerInfo,
        profiles: Vec<Profile>,
    },
    ConnectionSaved {
        flow: FlowId,
        connection: VpnConnection,
    },
    /// The server no longer accepts the stored grant.
    AuthorizationExpired { flow: FlowId },
    /// A background step of the current flow failed.
    FlowFailed { flow: FlowId, error: UiError },
    DiscoveryLoaded(Result<DiscoverySnapshot, DiscoveryError>),
    /// The server was told about the disconnect (or could not be reached).
    ServerDisconnected { server: Server },
    Shutdown,
}

impl Message {
    /// The flow a background result belongs to, if it is flow-bound.
    pub fn flow(&self) -> Option<FlowId> {
        match self {
            Message::AuthorizationPending { flow, .. }
            | Message::AuthorizationFinished { flow, .. }
            | Message::AuthorizationSetupFailed { flow, .. }
            | Message::TokenRefreshed { flow, .. }
            | Message::ProfilesFetched { flow, .. }
            | Message::ConnectionSaved { flow, .. }
            | Message::AuthorizationExpired { flow }
            | Message::FlowFailed { flow, .. } => Some(*flow),
            _ => None,
        }
    }
}

/// Posts messages to the model's loop from any thread.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Message>,
}

impl Dispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, message: Message) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Model loop is gone, dropping message");
        }
    }
}

/// Handed to the network backend so it can report tunnel status changes.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    dispatcher: Dispatcher,
}

impl StatusReporter {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn report(&self, event: NetworkEvent) {
        tracing::debug!(?event, "Backend status change");
        self.dispatcher.post(Message::Network(event));
    }

    pub fn established(&self) {
        self.report(NetworkEvent::ConnectionEstablished);
    }

    pub fn lost(&self) {
        self.report(NetworkEvent::ConnectionLost);
    }

    pub fn failed(&self, description: impl Into<String>) {
        self.report(NetworkEvent::ConnectionFailed {
            description: description.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reporter_posts_network_events() {
        let (dispatcher, mut rx) = Dispatcher::new();
        let reporter = StatusReporter::new(dispatcher.clone());

        reporter.established();
        reporter.failed("tls handshake");

        assert!(matches!(
            rx.recv().await,
            Some(Message::Network(NetworkEvent::ConnectionEstablished))
        ));
        let Some(Message::Network(NetworkEvent::ConnectionFailed { description })) = rx.recv().await
        else {
            panic!("expected failure report");
        };
        assert_eq!(description, "tls handshake");
    }

    #[tokio::test]
    async fn test_post_after_receiver_dropped_is_silent() {
        let (dispatcher, rx) = Dispatcher::new();
        drop(rx);
        dispatcher.post(Message::Shutdown);
    }

    #[test]
    fn test_flow_of_background_results() {
        assert_eq!(Message::AuthorizationExpired { flow: 7 }.flow(), Some(7));
        assert_eq!(Message::Shutdown.flow(), None);
    }
}
