//! Remove command - forgets a configured server.

use anyhow::{Result, bail};
use clap::Args;
use console::style;

use super::Context;
use crate::session::{Outcome, Session};

/// Arguments for the remove command.
#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Login URL or address of the configured server
    pub server: String,
}

/// Run the remove command.
pub async fn run(args: RemoveArgs, ctx: &Context) -> Result<()> {
    let mut session = Session::start(ctx).await?;
    let Some(server) = session.configured(&args.server) else {
        session.close().await;
        bail!("'{}' is not a configured server (see `eduvpn list`)", args.server);
    };

    let active = session.model.network_state().is_active()
        && session
            .model
            .network_state()
            .server()
            .is_some_and(|s| s.login_url() == server.login_url());
    if active {
        let outcome = Outcome::default();
        session.model.disconnect(outcome.recorder())?;
        if let Err(e) = session.wait(&outcome).await {
            tracing::warn!(error = %e, "Disconnect before removal failed");
        }
    }

    let removed = session.model.remove(&server);
    session.close().await;
    removed?;

    if ctx.json_output {
        println!("{}", serde_json::json!({ "removed": server.login_url() }));
    } else {
        println!(
            "{} Removed {}",
            style("✓").green(),
            style(ctx.display_name(&server)).bold()
        );
    }
    Ok(())
}
