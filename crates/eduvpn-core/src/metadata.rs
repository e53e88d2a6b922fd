//! Persisted per-server state needed to resume a session.
//!
//! Stored as one JSON document (`metadata.json`) keyed by login URL and
//! rewritten as a whole on every change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eduvpn_discovery::{Protocol, Server};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{CoreError, Result};

/// Default metadata filename.
const METADATA_FILE: &str = "metadata.json";

/// What is remembered about a configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub server: Server,
    pub display_name: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub validity_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub validity_end: Option<DateTime<Utc>>,
}

impl ServerMetadata {
    pub fn new(server: Server, display_name: impl Into<String>) -> Self {
        let country_code = server.country_code().map(str::to_string);
        Self {
            server,
            display_name: display_name.into(),
            profile_id: None,
            protocol: None,
            country_code,
            token_endpoint: None,
            authorization_endpoint: None,
            validity_start: None,
            validity_end: None,
        }
    }

    /// The login URL this entry is keyed by.
    pub fn auth_url(&self) -> &str {
        self.server.login_url()
    }
}

pub type MetadataMap = BTreeMap<String, ServerMetadata>;

#[async_trait]
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    async fn load_all(&self) -> Result<MetadataMap>;

    /// Store (or replace) the entry for its login URL.
    async fn put(&self, metadata: ServerMetadata) -> Result<()>;

    /// Forget a login URL. Missing entries are not an error.
    async fn remove(&self, login_url: &str) -> Result<()>;
}

/// JSON-file metadata store.
#[derive(Debug)]
pub struct FileMetadataStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileMetadataStore {
    pub fn new(data_dir: &Path) -> Self {
        Self::with_path(data_dir.join(METADATA_FILE))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<MetadataMap> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(MetadataMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MetadataMap::new()),
            Err(e) => Err(CoreError::Storage(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut MetadataMap) + Send,
    {
        let _guard = self.lock.write().await;
        let mut map = self.read_file().await?;
        change(&mut map);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(&map)?).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn load_all(&self) -> Result<MetadataMap> {
        let _guard = self.lock.read().await;
        self.read_file().await
    }

    async fn put(&self, metadata: ServerMetadata) -> Result<()> {
        let key = metadata.auth_url().to_string();
        self.update(move |map| {
            map.insert(key, metadata);
        })
        .await
    }

    async fn remove(&self, login_url: &str) -> Result<()> {
        self.update(|map| {
            map.remove(login_url);
        })
        .await
    }
}

/// In-memory metadata store for testing.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    entries: RwLock<MetadataMap>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: MetadataMap) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn load_all(&self) -> Result<MetadataMap> {
        Ok(self.entries.read().await.clone())
    }

    async fn put(&self, metadata: ServerMetadata) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(metadata.auth_url().to_string(), metadata);
        Ok(())
    }

    async fn remove(&self, login_url: &str) -> Result<()> {
        self.entries.write().await.remove(login_url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eduvpn_discovery::CustomServer;
    use tempfile::TempDir;

    fn entry(host: &str) -> ServerMetadata {
        let mut m = ServerMetadata::new(Server::Custom(CustomServer::from_input(host)), host);
        m.profile_id = Some("internet".to_string());
        m.protocol = Some(Protocol::WireGuard);
        m
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileMetadataStore::new(dir.path());
        assert!(store.load_all().await.unwrap().is_empty());

        store.put(entry("a.example")).await.unwrap();
        store.put(entry("b.example")).await.unwrap();
        store.remove("https://a.example/").await.unwrap();

        let reopened = FileMetadataStore::new(dir.path());
        let map = reopened.load_all().await.unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["https://b.example/"], entry("b.example"));
        assert!(store.path().ends_with(METADATA_FILE));
    }

    #[tokio::test]
    async fn test_put_replaces_same_server() {
        let store = InMemoryMetadataStore::new();
        store.put(entry("a.example")).await.unwrap();
        let mut updated = entry("a.example");
        updated.profile_id = Some("office".to_string());
        store.put(updated).await.unwrap();

        let map = store.load_all().await.unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["https://a.example/"].profile_id.as_deref(), Some("office"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), "{not json").unwrap();
        assert!(FileMetadataStore::new(dir.path()).load_all().await.is_err());
    }
}
