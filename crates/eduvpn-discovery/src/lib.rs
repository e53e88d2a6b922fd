//! Server discovery and the VPN server API.
//!
//! - [`discovery`] downloads signed server and organization lists
//! - [`signature`] checks minisign signatures before anything is parsed
//! - [`database`] indexes discovered and configured servers for search
//! - [`api`] talks to an individual server (info, profiles, connect)

pub mod api;
pub mod country;
pub mod database;
pub mod discovery;
pub mod error;
pub mod keys;
pub mod localized;
pub mod signature;
pub mod types;

pub use api::{ConnectRequest, ConnectionConfig, HttpServerApi, ServerApi};
pub use country::CountryNames;
pub use database::ServerDatabase;
pub use discovery::{DiscoveryClient, DiscoverySnapshot, DiscoverySource, DiscoveryVersions};
pub use error::{DiscoveryError, Result};
pub use keys::WireGuardKeypair;
pub use localized::LocalizedString;
pub use signature::SignatureVerifier;
pub use types::{
    CustomServer, InstituteServer, Organization, Profile, Protocol, SecureInternetServer, Server,
    ServerInfo, ServerKind,
};
