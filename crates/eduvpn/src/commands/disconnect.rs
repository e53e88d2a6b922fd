//! Disconnect command - tears down the active connection.

use anyhow::{Result, bail};
use clap::Args;
use console::style;

use super::Context;
use crate::session::{Outcome, Session};

/// Arguments for the disconnect command.
#[derive(Args, Debug)]
pub struct DisconnectArgs {}

/// Run the disconnect command.
pub async fn run(_args: DisconnectArgs, ctx: &Context) -> Result<()> {
    let mut session = Session::start(ctx).await?;
    let Some(server) = session
        .model
        .network_state()
        .server()
        .filter(|_| session.model.network_state().is_active())
        .cloned()
    else {
        session.close().await;
        bail!("Not connected");
    };

    let outcome = Outcome::default();
    session.model.disconnect(outcome.recorder())?;
    let waited = session.wait(&outcome).await;
    session.close().await;
    waited?;

    if ctx.json_output {
        println!(
            "{}",
            serde_json::json!({ "disconnected": true, "server": server.login_url() })
        );
    } else {
        println!(
            "{} Disconnected from {}",
            style("✓").green(),
            style(ctx.display_name(&server)).bold()
        );
    }
    Ok(())
}
