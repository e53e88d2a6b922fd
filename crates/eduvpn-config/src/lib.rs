//! Configuration system for the eduVPN client.
//!
//! Provides TOML-based configuration with:
//! - Config file layering (XDG user config + local override)
//! - Typed sections with defaults for every key
//! - Validation that falls back to defaults with a warning

pub mod error;
pub mod loader;
pub mod types;

pub use error::{ConfigError, Result};
pub use loader::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, xdg_config_dir, xdg_config_path,
};
pub use types::*;
