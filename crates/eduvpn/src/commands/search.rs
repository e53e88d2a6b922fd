//! Search command - finds institutes, organizations and server addresses.

use anyhow::Result;
use clap::Args;
use console::style;
use eduvpn_core::InterfaceState;

use super::{Context, ServerOutput, print_servers};
use crate::session::Session;

/// Arguments for the search command.
#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Name, keyword or server address
    pub query: String,
}

/// Run the search command.
pub async fn run(args: SearchArgs, ctx: &Context) -> Result<()> {
    let mut session = Session::start(ctx).await?;
    session.search(&args.query).await?;

    let model = &session.model;
    let results: Vec<ServerOutput> = match model.interface_state().underlying() {
        InterfaceState::SearchResults {
            results,
            refresh_error,
            ..
        } => {
            if let Some(error) = refresh_error {
                eprintln!(
                    "{} The server list could not be refreshed, showing earlier results: {}",
                    style("!").yellow(),
                    error
                );
            }
            results
                .iter()
                .map(|s| ServerOutput::new(ctx, s, model.metadata().get(s.login_url())))
                .collect()
        }
        InterfaceState::CustomServerEntry { server, .. } => {
            vec![ServerOutput::new(ctx, server, None)]
        }
        InterfaceState::Error { error, .. } => anyhow::bail!("Search failed: {}", error),
        _ => Vec::new(),
    };

    print_servers(ctx, &format!("Results for '{}'", args.query), &results)?;
    session.close().await;
    Ok(())
}
