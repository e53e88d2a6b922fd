//! Renew command - reauthorizes and replaces the active configuration.

use anyhow::{Result, bail};
use clap::Args;
use console::style;

use eduvpn_core::{InterfaceStateKind, Observable};

use super::Context;
use crate::session::{Choices, Session};

/// Arguments for the renew command.
#[derive(Args, Debug)]
pub struct RenewArgs {
    /// Profile to reconnect with (default: the current one)
    #[arg(short, long)]
    pub profile: Option<String>,
}

/// Run the renew command.
pub async fn run(args: RenewArgs, ctx: &Context) -> Result<()> {
    let mut session = Session::start(ctx).await?;
    if session.model.interface_state().underlying().kind() != InterfaceStateKind::ConnectionStatus {
        session.close().await;
        bail!("No active session to renew, use `eduvpn connect`");
    }
    let Some(server) = session.model.current_server().cloned() else {
        session.close().await;
        bail!("No active session to renew, use `eduvpn connect`");
    };
    if let Some(profile) = &args.profile {
        session.model.prefer_profile(&server, profile.clone());
    }

    if !ctx.json_output {
        println!("Renewing session for {}", style(ctx.display_name(&server)).bold());
    }
    session.model.renew_session()?;

    let choices = Choices {
        profile: args.profile,
        ..Default::default()
    };
    let driven = session.drive(&choices).await;
    let expires = session.model.session_validity().map(|v| v.end());
    session.close().await;
    driven?;

    if ctx.json_output {
        println!(
            "{}",
            serde_json::json!({ "renewed": true, "server": server.login_url(), "expires": expires })
        );
    } else {
        println!("{} Session renewed", style("✓").green());
        if let Some(expires) = expires {
            println!(
                "  Valid until {}",
                expires.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(())
}
