//! Connect command - authorizes if needed and exports a configuration.

use anyhow::Result;
use clap::Args;
use console::style;

use super::Context;
use crate::session::{Choices, Outcome, Session};

/// Arguments for the connect command.
#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Server address, login URL, or a search term matching one server
    pub server: String,

    /// Profile to connect with
    #[arg(short, long)]
    pub profile: Option<String>,

    /// Country code of the secure internet location
    #[arg(short, long)]
    pub location: Option<String>,
}

/// Run the connect command.
pub async fn run(args: ConnectArgs, ctx: &Context) -> Result<()> {
    let mut session = Session::start(ctx).await?;
    let server = session.resolve(&args.server).await?;

    if let Some(profile) = &args.profile {
        session.model.prefer_profile(&server, profile.clone());
    }

    let outcome = Outcome::default();
    session.model.connect(server.clone(), outcome.recorder(), true)?;

    let choices = Choices {
        profile: args.profile,
        location: args.location,
    };
    let driven = session.drive(&choices).await;

    // An organization resolves to one of its secure internet locations.
    let connected = session
        .model
        .network_state()
        .server()
        .cloned()
        .unwrap_or(server);
    let exported = session
        .backend
        .exported(&connected)
        .map(|p| p.display().to_string());
    session.close().await;
    driven?;
    if let Some(Err(e)) = outcome.take() {
        return Err(e.into());
    }

    if ctx.json_output {
        println!(
            "{}",
            serde_json::json!({
                "connected": true,
                "server": connected.login_url(),
                "config": exported,
            })
        );
    } else {
        println!(
            "{} Connected to {}",
            style("✓").green(),
            style(ctx.display_name(&connected)).bold()
        );
        if let Some(path) = exported {
            println!("  Configuration written to {}", path);
        }
    }
    Ok(())
}
