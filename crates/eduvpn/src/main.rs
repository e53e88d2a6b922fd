//! eduVPN command line client.
//!
//! Finds servers, authorizes, and exports VPN configurations for an
//! external tunnel tool.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod backend;
mod commands;
mod session;

use commands::{connect, disconnect, list, remove, renew, search, status};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// eduVPN command line client
#[derive(Parser)]
#[command(name = "eduvpn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Print the authorization URL instead of opening a browser
    #[arg(long, global = true)]
    pub no_browser: bool,

    /// Configuration directory (default: ~/.config/eduvpn)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Search institutes, organizations or a server address
    Search(search::SearchArgs),

    /// List configured servers
    List(list::ListArgs),

    /// Connect to a server
    Connect(connect::ConnectArgs),

    /// Disconnect the active connection
    Disconnect(disconnect::DisconnectArgs),

    /// Show the connection and session status
    Status(status::StatusArgs),

    /// Renew the session of the active connection
    Renew(renew::RenewArgs),

    /// Forget a configured server
    Remove(remove::RemoveArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console (human-readable, stderr) + rotating JSON file
    let filter = if cli.verbose {
        "eduvpn=debug,eduvpn_core=debug,eduvpn_oauth=debug,eduvpn_discovery=debug,eduvpn_config=debug,info"
    } else {
        "eduvpn=info,eduvpn_core=info,eduvpn_oauth=info,eduvpn_discovery=info,eduvpn_config=info,warn"
    };

    let log_dir = cli
        .config_dir
        .clone()
        .or_else(eduvpn_config::xdg_config_dir)
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "eduvpn.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(cli.verbose)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "eduvpn=trace,eduvpn_core=trace,eduvpn_oauth=trace,eduvpn_discovery=trace,eduvpn_config=trace,info",
                )),
        )
        .init();

    let ctx = commands::Context::load(&cli)?;

    match cli.command {
        Commands::Search(args) => search::run(args, &ctx).await,
        Commands::List(args) => list::run(args, &ctx).await,
        Commands::Connect(args) => connect::run(args, &ctx).await,
        Commands::Disconnect(args) => disconnect::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Renew(args) => renew::run(args, &ctx).await,
        Commands::Remove(args) => remove::run(args, &ctx).await,
    }
}
