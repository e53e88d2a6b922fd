//! CLI command handlers.

pub mod connect;
pub mod disconnect;
pub mod list;
pub mod remove;
pub mod renew;
pub mod search;
pub mod status;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use console::Style;
use eduvpn_config::EduVpnConfig;
use eduvpn_core::ServerMetadata;
use eduvpn_discovery::{CountryNames, Server, ServerKind};
use serde::Serialize;

use crate::Cli;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// The merged configuration.
    pub config: EduVpnConfig,
    /// Where tokens, metadata and exported configurations live.
    pub data_dir: PathBuf,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Print the authorization URL instead of opening a browser.
    pub no_browser: bool,
}

impl Context {
    pub fn load(cli: &Cli) -> Result<Self> {
        let loaded = eduvpn_config::load_config_with_options(None, cli.config_dir.as_deref())
            .context("Failed to load configuration")?;
        for warning in &loaded.warnings {
            tracing::warn!("{}", warning);
        }
        for path in loaded.loaded_from() {
            tracing::debug!(path = %path.display(), "Loaded config layer");
        }

        let data_dir = loaded
            .config
            .client()
            .effective_data_dir()
            .context("Cannot determine the data directory")?;

        Ok(Self {
            config: loaded.config,
            data_dir,
            json_output: cli.json,
            verbose: cli.verbose,
            no_browser: cli.no_browser,
        })
    }

    pub fn language(&self) -> String {
        self.config.client().language
    }

    pub fn display_name(&self, server: &Server) -> String {
        server.display_name(&self.language(), CountryNames::global())
    }
}

/// A server as printed by `search` and `list`.
#[derive(Debug, Serialize)]
pub struct ServerOutput {
    pub name: String,
    pub kind: ServerKind,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub active: bool,
}

impl ServerOutput {
    pub fn new(ctx: &Context, server: &Server, metadata: Option<&ServerMetadata>) -> Self {
        Self {
            name: ctx.display_name(server),
            kind: server.kind(),
            url: server.login_url().to_string(),
            profile: metadata.and_then(|m| m.profile_id.clone()),
            active: false,
        }
    }
}

/// Print a list of servers as a table or JSON.
pub fn print_servers(ctx: &Context, title: &str, servers: &[ServerOutput]) -> Result<()> {
    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(servers)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    let green = Style::new().green();

    println!();
    println!("{}", console::style(title).bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    if servers.is_empty() {
        println!("  {}", dim.apply_to("(none)"));
    }
    for server in servers {
        let marker = if server.active {
            green.apply_to("●").to_string()
        } else {
            " ".to_string()
        };
        println!("{} {}", marker, console::style(&server.name).bold());
        println!("    {} {}", dim.apply_to(kind_label(server.kind)), server.url);
        if let Some(profile) = &server.profile {
            println!("    {} {}", dim.apply_to("profile:"), profile);
        }
    }
    println!();
    Ok(())
}

fn kind_label(kind: ServerKind) -> &'static str {
    match kind {
        ServerKind::InstituteAccess => "institute:",
        ServerKind::Organization => "organization:",
        ServerKind::SecureInternet => "secure internet:",
        ServerKind::Custom => "custom:",
    }
}
