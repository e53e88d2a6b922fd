//! Status command - shows the connection and its session validity.

use anyhow::Result;
use chrono::{DateTime, Duration, Local, Utc};
use clap::Args;
use console::{Style, style};
use serde::Serialize;

use eduvpn_core::{NetworkState, NetworkStateKind, Observable};

use super::Context;
use crate::session::Session;

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Also show renewal and reminder times
    #[arg(short, long)]
    pub detailed: bool,
}

/// Status for JSON output.
#[derive(Debug, Serialize)]
struct StatusOutput {
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_expiry: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<String>,
}

/// Run the status command.
pub async fn run(args: StatusArgs, ctx: &Context) -> Result<()> {
    let session = Session::start(ctx).await?;
    let model = &session.model;
    let now = Utc::now();
    let network = model.network_state();
    let server = network.server();
    let metadata = server.and_then(|s| model.metadata().get(s.login_url()));
    let validity = model.session_validity().filter(|_| network.is_active());

    let output = StatusOutput {
        state: state_label(network.kind()).to_string(),
        server: server.map(|s| s.login_url().to_string()),
        name: server.map(|s| ctx.display_name(s)),
        profile: metadata.and_then(|m| m.profile_id.clone()),
        expires: validity.map(|v| v.end()),
        pending_expiry: validity.map(|v| v.is_pending_expiry(now)),
        config: server
            .and_then(|s| session.backend.exported(s))
            .map(|p| p.display().to_string()),
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
        session.close().await;
        return Ok(());
    }

    let dim = Style::new().dim();
    println!();
    println!("{}", style("eduVPN Status").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();
    println!("  {} {}", dim.apply_to("Status:"), styled_state(network));
    if let Some(name) = &output.name {
        println!("  {} {}", dim.apply_to("Server:"), name);
    }
    if let Some(url) = &output.server {
        println!("  {} {}", dim.apply_to("Address:"), url);
    }
    if let Some(profile) = &output.profile {
        println!("  {} {}", dim.apply_to("Profile:"), profile);
    }
    if let Some(validity) = validity {
        let remaining = validity.remaining(now);
        let line = format!(
            "{} (in {})",
            validity.end().with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            format_duration(remaining)
        );
        if validity.is_pending_expiry(now) {
            println!(
                "  {} {}",
                dim.apply_to("Expires:"),
                Style::new().yellow().apply_to(line)
            );
            println!("  {}", dim.apply_to("Run `eduvpn renew` to extend the session."));
        } else {
            println!("  {} {}", dim.apply_to("Expires:"), line);
        }

        if args.detailed {
            let format = |t: DateTime<Utc>| t.with_timezone(&Local).format("%H:%M").to_string();
            println!(
                "  {} {}",
                dim.apply_to("Renewable:"),
                if validity.is_renew_button_visible(now) {
                    "now".to_string()
                } else {
                    format!("from {}", format(validity.renew_button_time()))
                }
            );
            if let Some(next) = validity.next_notification(now) {
                println!("  {} {}", dim.apply_to("Reminder:"), format(next));
            }
        }
    }
    if let Some(path) = &output.config {
        println!("  {} {}", dim.apply_to("Config:"), path);
    }
    println!();

    session.close().await;
    Ok(())
}

fn state_label(kind: NetworkStateKind) -> &'static str {
    match kind {
        NetworkStateKind::Initial | NetworkStateKind::Unknown => "unknown",
        NetworkStateKind::Unconnected => "not connected",
        NetworkStateKind::Connecting => "connecting",
        NetworkStateKind::Connected => "connected",
        NetworkStateKind::Disconnected => "disconnected",
        NetworkStateKind::CertificateExpired => "expired",
        NetworkStateKind::ConnectionError => "error",
    }
}

fn styled_state(state: &NetworkState) -> String {
    let label = state_label(state.kind());
    match state {
        NetworkState::Connected { .. } => Style::new().green().apply_to(format!("● {}", label)).to_string(),
        NetworkState::Connecting { .. } => Style::new().yellow().apply_to(format!("● {}", label)).to_string(),
        NetworkState::ConnectionError { description, .. } => Style::new()
            .red()
            .apply_to(format!("● {}: {}", label, description))
            .to_string(),
        NetworkState::CertificateExpired { .. } => Style::new().red().apply_to(format!("● {}", label)).to_string(),
        _ => Style::new().dim().apply_to(format!("○ {}", label)).to_string(),
    }
}

/// `1h 05m`, `12m`, or `expired`.
fn format_duration(duration: Duration) -> String {
    if duration <= Duration::zero() {
        return "expired".to_string();
    }
    let hours = duration.num_hours();
    let minutes = duration.num_minutes() % 60;
    if hours >= 24 {
        format!("{}d {}h", hours / 24, hours % 24)
    } else if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else {
        format!("{}m", duration.num_minutes().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::minutes(-1)), "expired");
        assert_eq!(format_duration(Duration::seconds(20)), "1m");
        assert_eq!(format_duration(Duration::minutes(65)), "1h 05m");
        assert_eq!(format_duration(Duration::hours(50)), "2d 2h");
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(state_label(NetworkStateKind::Connected), "connected");
        assert_eq!(state_label(NetworkStateKind::Unknown), "unknown");
    }
}
