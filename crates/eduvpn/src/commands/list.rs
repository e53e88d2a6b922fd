//! List command - shows configured servers.

use anyhow::Result;
use clap::Args;

use super::{Context, ServerOutput, print_servers};
use crate::session::Session;

/// Arguments for the list command.
#[derive(Args, Debug)]
pub struct ListArgs {}

/// Run the list command.
pub async fn run(_args: ListArgs, ctx: &Context) -> Result<()> {
    let session = Session::start(ctx).await?;
    let model = &session.model;
    let active = model
        .network_state()
        .server()
        .filter(|_| model.network_state().is_active())
        .map(|s| s.login_url().to_string());

    let servers: Vec<ServerOutput> = model
        .database()
        .all_configured()
        .iter()
        .map(|server| {
            let mut output = ServerOutput::new(ctx, server, model.metadata().get(server.login_url()));
            output.active = active.as_deref() == Some(server.login_url());
            output
        })
        .collect();

    print_servers(ctx, "Configured servers", &servers)?;
    session.close().await;
    Ok(())
}
