//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/eduvpn/config.toml` (XDG user config)
//! 2. `./eduvpn.toml` (local override)
//! 3. CLI arguments (handled externally)

use std::path::{Path, PathBuf};

use crate::{ConfigError, EduVpnConfig, Result};

/// Default config filename for the local override.
const LOCAL_CONFIG_FILE: &str = "eduvpn.toml";

/// Default config filename within the XDG config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Application name for XDG directory resolution.
const APP_NAME: &str = "eduvpn";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "EDUVPN_CONFIG_DIR";

/// Environment variable to override the data directory.
pub const DATA_DIR_ENV: &str = "EDUVPN_DATA_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Path to the config file.
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: EduVpnConfig,
    /// Sources that were checked, in order of precedence (lowest first).
    pub sources: Vec<ConfigSource>,
    /// Warnings generated during loading (unparseable layers, bad values).
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Get paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Load configuration by discovering and merging all config layers.
pub fn load_config(local_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(local_dir, None)
}

/// Load configuration with explicit control over the user config directory.
///
/// `config_dir` overrides both `EDUVPN_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    local_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = EduVpnConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    // 1. User config — explicit override, then env var, then platform default
    let user_config_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => xdg_config_path(),
    };
    if let Some(path) = user_config_path {
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    // 2. Local override
    let local_path = local_dir
        .map(|d| d.join(LOCAL_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(LOCAL_CONFIG_FILE));
    sources.push(load_layer(&mut config, &local_path, &mut warnings));

    if let Err(e) = config.validate() {
        warnings.push(format!("{}; falling back to defaults for that section", e));
        reset_invalid_sections(&mut config);
    }

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<EduVpnConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    EduVpnConfig::from_toml(&contents)
}

/// Save configuration to a file.
///
/// Creates parent directories if they don't exist.
pub fn save_config(config: &EduVpnConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let contents = config.to_toml()?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// Get the XDG config file path for eduvpn.
pub fn xdg_config_path() -> Option<PathBuf> {
    xdg_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// Get the XDG config directory for eduvpn.
///
/// Checks `EDUVPN_CONFIG_DIR` env var first, then falls back to platform default.
pub fn xdg_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Try to load a config file and merge it into the existing config.
fn load_layer(config: &mut EduVpnConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    if !path.is_file() {
        return ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        };
    }

    match load_config_file(path) {
        Ok(layer) => {
            tracing::debug!(path = %path.display(), "Loaded config layer");
            config.merge(layer);
            ConfigSource {
                path: path.to_path_buf(),
                loaded: true,
            }
        }
        Err(e) => {
            warnings.push(format!("Failed to load {}: {}", path.display(), e));
            ConfigSource {
                path: path.to_path_buf(),
                loaded: false,
            }
        }
    }
}

/// Drop every section that fails validation so defaults apply instead.
fn reset_invalid_sections(config: &mut EduVpnConfig) {
    let check = |section: EduVpnConfig| section.validate().is_ok();

    if !check(EduVpnConfig {
        oauth: config.oauth.clone(),
        ..Default::default()
    }) {
        config.oauth = None;
    }
    if !check(EduVpnConfig {
        discovery: config.discovery.clone(),
        ..Default::default()
    }) {
        config.discovery = None;
    }
    if !check(EduVpnConfig {
        session: config.session.clone(),
        ..Default::default()
    }) {
        config.session = None;
    }
    if !check(EduVpnConfig {
        client: config.client.clone(),
        ..Default::default()
    }) {
        config.client = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
