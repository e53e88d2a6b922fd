//! Network backend that exports configurations for an external VPN tool.
//!
//! Each saved connection is written to `<data dir>/connections/<name>.ovpn`
//! (OpenVPN) or `<name>.conf` (WireGuard). Activating a connection records
//! its login URL in `connections/active` so the next run finds it again.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use eduvpn_core::{CoreError, NetworkBackend, Result, StatusReporter, VpnConnection};
use eduvpn_discovery::{Protocol, Server};

const CONNECTIONS_DIR: &str = "connections";
const ACTIVE_FILE: &str = "active";
const EXTENSIONS: [&str; 2] = ["ovpn", "conf"];

#[derive(Debug)]
pub struct ExportBackend {
    dir: PathBuf,
    reporter: Mutex<Option<StatusReporter>>,
}

impl ExportBackend {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(CONNECTIONS_DIR),
            reporter: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the configuration for `server` is written.
    pub fn config_path(&self, server: &Server, protocol: Protocol) -> PathBuf {
        let extension = match protocol {
            Protocol::OpenVpn => "ovpn",
            Protocol::WireGuard => "conf",
        };
        self.dir.join(format!("{}.{}", file_stem(server), extension))
    }

    /// The exported configuration for `server`, if there is one.
    pub fn exported(&self, server: &Server) -> Option<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", file_stem(server), ext)))
            .find(|path| path.exists())
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_FILE)
    }

    fn report(&self, f: impl FnOnce(&StatusReporter)) {
        match self.reporter.lock().as_ref() {
            Some(reporter) => f(reporter),
            None => tracing::debug!("No status reporter attached"),
        }
    }
}

#[async_trait]
impl NetworkBackend for ExportBackend {
    fn attach(&self, reporter: StatusReporter) {
        *self.reporter.lock() = Some(reporter);
    }

    async fn active_connection(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.active_path()).await {
            Ok(content) => {
                let login_url = content.trim();
                Ok((!login_url.is_empty()).then(|| login_url.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, connection: &VpnConnection) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        remove_exports(&self.dir, &connection.server).await?;

        let path = self.config_path(&connection.server, connection.protocol);
        tokio::fs::write(&path, &connection.config).await?;
        restrict_permissions(&path)?;
        tracing::info!(path = %path.display(), protocol = %connection.protocol, "Exported configuration");
        Ok(())
    }

    async fn remove(&self, server: &Server) -> Result<()> {
        remove_exports(&self.dir, server).await
    }

    fn activate(&self, server: &Server) {
        let result = std::fs::create_dir_all(&self.dir)
            .and_then(|()| std::fs::write(self.active_path(), server.login_url()));
        match result {
            Ok(()) => self.report(StatusReporter::established),
            Err(e) => {
                tracing::warn!(error = %e, "Could not record the active connection");
                self.report(|r| r.failed(e.to_string()));
            }
        }
    }

    fn deactivate(&self, server: &Server) {
        tracing::debug!(server = %server.login_url(), "Deactivating");
        if let Err(e) = std::fs::remove_file(self.active_path())
            && e.kind() != ErrorKind::NotFound
        {
            tracing::warn!(error = %e, "Could not clear the active connection");
        }
    }
}

/// File name for a server: its login URL without scheme, reduced to
/// `[a-z0-9-]`.
fn file_stem(server: &Server) -> String {
    let url = server.login_url();
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let mut stem = String::with_capacity(without_scheme.len());
    for c in without_scheme.chars() {
        if c.is_ascii_alphanumeric() {
            stem.push(c.to_ascii_lowercase());
        } else if !stem.ends_with('-') {
            stem.push('-');
        }
    }
    let stem = stem.trim_matches('-');
    if stem.is_empty() {
        "server".to_string()
    } else {
        stem.to_string()
    }
}

async fn remove_exports(dir: &Path, server: &Server) -> Result<()> {
    for ext in EXTENSIONS {
        let path = dir.join(format!("{}.{}", file_stem(server), ext));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed exported configuration"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CoreError::Backend(format!("{}: {}", path.display(), e))),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
