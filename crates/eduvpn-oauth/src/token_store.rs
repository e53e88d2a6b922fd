//! Persistence of OAuth tokens, keyed by the server's login URL.
//!
//! The file store reads and writes the whole map as a single JSON document.
//! There is no per-key locking; callers serialize writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::challenge::AuthorizedSession;
use crate::error::{OAuthError, Result};
use crate::token::OAuthToken;

/// Default token file name within the data directory.
pub const TOKEN_FILE: &str = "oauth-tokens.json";

/// A token with the endpoints needed to refresh or replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: OAuthToken,
    pub token_endpoint: String,
    pub authorization_endpoint: String,
}

impl From<AuthorizedSession> for StoredToken {
    fn from(session: AuthorizedSession) -> Self {
        Self {
            token: session.token,
            token_endpoint: session.token_endpoint,
            authorization_endpoint: session.authorization_endpoint,
        }
    }
}

/// All stored tokens, by login URL.
pub type TokenMap = BTreeMap<String, StoredToken>;

// ============================================================================
// TokenStore Trait
// ============================================================================

/// Storage for per-server tokens.
#[async_trait]
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    /// Load every stored token.
    async fn load_all(&self) -> Result<TokenMap>;

    /// Load the token for one login URL.
    async fn get(&self, login_url: &str) -> Result<Option<StoredToken>> {
        Ok(self.load_all().await?.remove(login_url))
    }

    /// Store (or replace) the token for a login URL.
    async fn put(&self, login_url: &str, token: StoredToken) -> Result<()>;

    /// Forget the token for a login URL. Missing entries are not an error.
    async fn remove(&self, login_url: &str) -> Result<()>;
}

/// Shared token store for use across async contexts.
pub type SharedTokenStore = Arc<dyn TokenStore>;

// ============================================================================
// FileTokenStore
// ============================================================================

/// JSON-file token store.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    cache: RwLock<Option<TokenMap>>,
}

impl FileTokenStore {
    /// Create a store in the given data directory.
    pub fn new(data_dir: &Path) -> Self {
        Self::with_path(data_dir.join(TOKEN_FILE))
    }

    /// Create a store backed by a specific file.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<TokenMap> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(TokenMap::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                OAuthError::Serialization(format!("Failed to parse token file: {}", e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TokenMap::new()),
            Err(e) => Err(OAuthError::Store(format!(
                "Failed to read token file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_file(&self, tokens: &TokenMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OAuthError::Store(format!("Failed to create token directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(tokens)?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| OAuthError::Store(format!("Failed to write token file: {}", e)))?;
        restrict_permissions(&self.path).await;
        Ok(())
    }

    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut TokenMap) + Send,
    {
        let mut cache = self.cache.write().await;
        let mut tokens = match cache.take() {
            Some(tokens) => tokens,
            None => self.read_file().await?,
        };
        change(&mut tokens);
        let written = self.write_file(&tokens).await;
        *cache = Some(tokens);
        written
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load_all(&self) -> Result<TokenMap> {
        {
            let cache = self.cache.read().await;
            if let Some(tokens) = cache.as_ref() {
                return Ok(tokens.clone());
            }
        }

        let tokens = self.read_file().await?;
        *self.cache.write().await = Some(tokens.clone());
        Ok(tokens)
    }

    async fn put(&self, login_url: &str, token: StoredToken) -> Result<()> {
        let key = login_url.to_string();
        self.update(move |tokens| {
            tokens.insert(key, token);
        })
        .await?;
        tracing::info!(server = %login_url, "Token saved to {}", self.path.display());
        Ok(())
    }

    async fn remove(&self, login_url: &str) -> Result<()> {
        self.update(|tokens| {
            tokens.remove(login_url);
        })
        .await?;
        tracing::info!(server = %login_url, "Token removed");
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) =
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
    {
        tracing::warn!(error = %e, "Could not restrict token file permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}

// ============================================================================
// InMemoryTokenStore (for testing)
// ============================================================================

/// In-memory token store for testing.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<TokenMap>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenMap) -> Self {
        Self {
            tokens: RwLock::new(tokens),
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn load_all(&self) -> Result<TokenMap> {
        Ok(self.tokens.read().await.clone())
    }

    async fn put(&self, login_url: &str, token: StoredToken) -> Result<()> {
        self.tokens
            .write()
            .await
            .insert(login_url.to_string(), token);
        Ok(())
    }

    async fn remove(&self, login_url: &str) -> Result<()> {
        self.tokens.write().await.remove(login_url);
        Ok(())
    }
}
