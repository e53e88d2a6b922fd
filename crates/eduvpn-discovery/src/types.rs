//! Server, profile and endpoint types.
//!
//! Servers form a closed set of variants. Everything that differs between
//! them (how they are identified, where they log in, how they are named) is
//! exposed through capability methods on [`Server`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::country::CountryNames;
use crate::localized::LocalizedString;

// ─────────────────────────────────────────────────────────────────────────────
// Server variants
// ─────────────────────────────────────────────────────────────────────────────

/// An institute access server from the discovery list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstituteServer {
    pub base_url: String,
    pub display_name: LocalizedString,
    #[serde(default, rename = "keyword_list", skip_serializing_if = "Option::is_none")]
    pub keywords: Option<LocalizedString>,
    #[serde(default, rename = "support_contact")]
    pub support_contacts: Vec<String>,
}

/// An organization offering secure internet access.
///
/// Organizations are not VPN servers themselves; users log in at the
/// organization's `secure_internet_home` and then pick a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: String,
    pub display_name: LocalizedString,
    #[serde(default, rename = "keyword_list", skip_serializing_if = "Option::is_none")]
    pub keywords: Option<LocalizedString>,
    pub secure_internet_home: String,
}

/// A secure internet location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureInternetServer {
    pub base_url: String,
    pub country_code: String,
    #[serde(default, rename = "support_contact")]
    pub support_contacts: Vec<String>,
    /// Base URL of the home server the user authorized at, once reached
    /// through an organization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_base_url: Option<String>,
    /// Organization the location was reached through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl SecureInternetServer {
    /// This location as reached through `org`, sharing its authorization.
    pub fn via(&self, org: &Organization) -> Self {
        Self {
            home_base_url: Some(org.secure_internet_home.clone()),
            org_id: Some(org.org_id.clone()),
            ..self.clone()
        }
    }
}

/// A server entered by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomServer {
    pub base_url: String,
}

impl CustomServer {
    /// Build a custom server from user input, adding `https://` and a
    /// trailing slash where missing.
    pub fn from_input(input: &str) -> Self {
        let trimmed = input.trim();
        let mut base_url = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        };
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { base_url }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// The kind of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    InstituteAccess,
    Organization,
    SecureInternet,
    Custom,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerKind::InstituteAccess => "institute access",
            ServerKind::Organization => "organization",
            ServerKind::SecureInternet => "secure internet",
            ServerKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Any server the user can connect to or search for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Server {
    InstituteAccess(InstituteServer),
    Organization(Organization),
    SecureInternet(SecureInternetServer),
    Custom(CustomServer),
}

impl Server {
    pub fn kind(&self) -> ServerKind {
        match self {
            Server::InstituteAccess(_) => ServerKind::InstituteAccess,
            Server::Organization(_) => ServerKind::Organization,
            Server::SecureInternet(_) => ServerKind::SecureInternet,
            Server::Custom(_) => ServerKind::Custom,
        }
    }

    /// The URL stored authorization state is keyed by.
    ///
    /// All locations of one organization share the home server's login URL.
    pub fn login_url(&self) -> &str {
        match self {
            Server::InstituteAccess(s) => &s.base_url,
            Server::Organization(o) => &o.secure_internet_home,
            Server::SecureInternet(s) => s.home_base_url.as_deref().unwrap_or(&s.base_url),
            Server::Custom(s) => &s.base_url,
        }
    }

    /// The URL the server info document is fetched from.
    pub fn base_url(&self) -> &str {
        match self {
            Server::InstituteAccess(s) => &s.base_url,
            Server::Organization(o) => &o.secure_internet_home,
            Server::SecureInternet(s) => &s.base_url,
            Server::Custom(s) => &s.base_url,
        }
    }

    pub fn display_name(&self, lang: &str, countries: &CountryNames) -> String {
        match self {
            Server::InstituteAccess(s) => s.display_name.resolve(lang).to_string(),
            Server::Organization(o) => o.display_name.resolve(lang).to_string(),
            Server::SecureInternet(s) => countries.name_or_code(&s.country_code).to_string(),
            Server::Custom(s) => s
                .base_url
                .split("://")
                .last()
                .unwrap_or(&s.base_url)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    pub fn support_contacts(&self) -> &[String] {
        match self {
            Server::InstituteAccess(s) => &s.support_contacts,
            Server::SecureInternet(s) => &s.support_contacts,
            Server::Organization(_) | Server::Custom(_) => &[],
        }
    }

    /// Country code, for secure internet locations only.
    pub fn country_code(&self) -> Option<&str> {
        match self {
            Server::SecureInternet(s) => Some(&s.country_code),
            _ => None,
        }
    }

    /// Whether a secure internet location has to be resolved before
    /// profiles can be fetched.
    pub fn needs_location(&self) -> bool {
        matches!(self, Server::Organization(_))
    }

    /// Case-insensitive match of display names and keywords in any language.
    pub fn matches(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        let (name, keywords) = match self {
            Server::InstituteAccess(s) => (&s.display_name, s.keywords.as_ref()),
            Server::Organization(o) => (&o.display_name, o.keywords.as_ref()),
            Server::SecureInternet(s) => return s.country_code.to_lowercase() == needle,
            Server::Custom(s) => return s.base_url.to_lowercase().contains(&needle),
        };
        name.contains_lowercase(&needle)
            || keywords.is_some_and(|k| k.contains_lowercase(&needle))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Profiles and endpoints
// ─────────────────────────────────────────────────────────────────────────────

/// VPN protocol offered by a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "openvpn")]
    OpenVpn,
    #[serde(rename = "wireguard")]
    WireGuard,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::OpenVpn => f.write_str("OpenVPN"),
            Protocol::WireGuard => f.write_str("WireGuard"),
        }
    }
}

/// A VPN profile offered by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub display_name: LocalizedString,
    #[serde(default)]
    pub default_gateway: bool,
    #[serde(default)]
    pub protocols: Vec<Protocol>,
}

impl Profile {
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol)
    }
}

/// Endpoints advertised by a server's info document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub api_endpoint: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn organization() -> Organization {
        Organization {
            org_id: "https://idp.example.org".to_string(),
            display_name: "Example Organization".into(),
            keywords: Some("examplekeyword".into()),
            secure_internet_home: "https://home.example.org/".to_string(),
        }
    }

    #[test]
    fn test_custom_server_normalization() {
        assert_eq!(
            CustomServer::from_input(" vpn.example.org ").base_url,
            "https://vpn.example.org/"
        );
        assert_eq!(
            CustomServer::from_input("http://vpn.example.org/").base_url,
            "http://vpn.example.org/"
        );
    }

    #[test]
    fn test_location_shares_home_login_url() {
        let location = SecureInternetServer {
            base_url: "https://de.example.org/".to_string(),
            country_code: "DE".to_string(),
            support_contacts: vec![],
            home_base_url: None,
            org_id: None,
        };
        assert_eq!(Server::SecureInternet(location.clone()).login_url(), "https://de.example.org/");

        let reached = Server::SecureInternet(location.via(&organization()));
        assert_eq!(reached.login_url(), "https://home.example.org/");
        assert_eq!(reached.base_url(), "https://de.example.org/");
        assert_eq!(reached.country_code(), Some("DE"));
        assert_eq!(
            reached.display_name("en", CountryNames::global()),
            "Germany"
        );
    }

    #[test]
    fn test_matches_keywords_case_insensitive() {
        let org = Server::Organization(organization());
        assert!(org.matches("EXAMPLE org"));
        assert!(org.matches("KeyWord"));
        assert!(org.matches(""));
        assert!(!org.matches("nothing"));
        assert!(org.needs_location());
    }

    #[test]
    fn test_server_serde_tagged() {
        let server = Server::Custom(CustomServer::from_input("vpn.example.org"));
        let json = serde_json::to_string(&server).unwrap();
        assert!(json.contains(r#""kind":"custom""#));
        let back: Server = serde_json::from_str(&json).unwrap();
        assert_eq!(back, server);
        assert_eq!(back.display_name("en", CountryNames::global()), "vpn.example.org");
    }

    #[test]
    fn test_protocol_wire_names() {
        let list: Vec<Protocol> = serde_json::from_str(r#"["openvpn", "wireguard"]"#).unwrap();
        assert_eq!(list, vec![Protocol::OpenVpn, Protocol::WireGuard]);
    }
}
