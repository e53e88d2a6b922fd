//! OAuth 2.0 authorization code flow with PKCE for VPN servers.
//!
//! # Components
//!
//! - [`pkce`] — verifier/challenge and CSRF state generation
//! - [`callback`] — one-shot loopback listener capturing the redirect
//! - [`challenge`] — authorization URL, redirect validation, code exchange
//! - [`token`] — token type and the RFC 6749 token endpoint client
//! - [`token_store`] — per-server token persistence
//! - [`browser`] — opening the authorization page

pub mod browser;
pub mod callback;
pub mod challenge;
pub mod error;
pub mod pkce;
pub mod token;
pub mod token_store;

pub use browser::{Browser, PrintBrowser, SystemBrowser};
pub use callback::{CallbackParams, CallbackPaths, CallbackResult, CallbackServer, StopHandle};
pub use challenge::{
    AuthorizedSession, Authorizer, Challenge, ChallengePhase, OAuthClientConfig,
    PendingAuthorization,
};
pub use error::{OAuthError, Result};
pub use pkce::{PkceChallenge, generate_code_challenge, generate_code_verifier, generate_state};
pub use token::{HttpTokenClient, OAuthToken, TokenClient};
pub use token_store::{
    FileTokenStore, InMemoryTokenStore, SharedTokenStore, StoredToken, TokenMap, TokenStore,
};
