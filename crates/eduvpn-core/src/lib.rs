//! Session lifecycle engine for the eduVPN client.
//!
//! Two independent state machines, [`InterfaceState`] (what the user sees)
//! and [`NetworkState`] (what the tunnel does), are kept consistent by the
//! [`ApplicationModel`]. Neither machine touches the other; the model
//! funnels every transition through its own loop.

pub mod dispatch;
pub mod error;
pub mod interface;
pub mod metadata;
pub mod model;
pub mod network;
pub mod notify;
pub mod validity;

pub use dispatch::{Dispatcher, FlowId, Message, StatusReporter};
pub use error::{CoreError, ErrorKind, InvalidTransition, Result, UiError};
pub use interface::{
    Command, InterfaceEvent, InterfaceState, InterfaceStateKind, Transition, TransitionContext,
};
pub use metadata::{
    FileMetadataStore, InMemoryMetadataStore, MetadataMap, MetadataStore, ServerMetadata,
};
pub use model::{ApplicationModel, Callback, ModelSettings, Services};
pub use network::{NetworkBackend, NetworkEvent, NetworkState, NetworkStateKind, VpnConnection};
pub use notify::{Edge, Notifier, Observable, SubscriptionId};
pub use validity::SessionValidity;
