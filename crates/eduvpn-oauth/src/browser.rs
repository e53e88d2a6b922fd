//! Opening the authorization URL in the user's browser.

use crate::error::{OAuthError, Result};

/// Something that can show the authorization page to the user.
pub trait Browser: Send + Sync + std::fmt::Debug {
    /// Open `url`. Must not block until the user finished authorizing.
    fn open(&self, url: &str) -> Result<()>;
}

/// Opens URLs with the platform's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl Browser for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        tracing::debug!("Opening authorization page in the system browser");
        open_url(url).map_err(|e| OAuthError::Browser(e.to_string()))
    }
}

/// Prints the URL instead of opening it, for headless sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintBrowser;

impl Browser for PrintBrowser {
    fn open(&self, url: &str) -> Result<()> {
        println!("Open this URL in your browser to authorize:");
        println!();
        println!("  {}", url);
        println!();
        Ok(())
    }
}

/// Try to open a URL in the default browser.
fn open_url(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .spawn()?;
    }
    Ok(())
}
