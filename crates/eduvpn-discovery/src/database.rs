//! Searchable index of discovered and configured servers.

use std::sync::Arc;

use crate::api::ServerApi;
use crate::discovery::{DiscoverySnapshot, DiscoveryVersions};
use crate::error::Result;
use crate::types::{CustomServer, Organization, SecureInternetServer, Server, ServerInfo};

/// Discovered servers plus the servers the user configured.
///
/// Searches run over an immutable [`DiscoverySnapshot`]; a refresh replaces
/// the snapshot as a whole. Cloning is cheap for the discovery part.
#[derive(Debug, Clone, Default)]
pub struct ServerDatabase {
    snapshot: Arc<DiscoverySnapshot>,
    configured: Vec<Server>,
}

impl ServerDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configured(configured: Vec<Server>) -> Self {
        Self {
            configured,
            ..Self::default()
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Discovery snapshot
    // ─────────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Arc<DiscoverySnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Versions of the current snapshot, `None` before the first refresh.
    pub fn versions(&self) -> Option<DiscoveryVersions> {
        (self.snapshot.versions != DiscoveryVersions::default()).then_some(self.snapshot.versions)
    }

    pub fn replace_snapshot(&mut self, snapshot: DiscoverySnapshot) {
        self.snapshot = Arc::new(snapshot);
    }

    pub fn has_discovery(&self) -> bool {
        !(self.snapshot.institutes.is_empty() && self.snapshot.organizations.is_empty())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configured servers
    // ─────────────────────────────────────────────────────────────────────────

    /// Servers the user authorized before. Order is insertion order.
    pub fn all_configured(&self) -> &[Server] {
        &self.configured
    }

    pub fn has_configured(&self) -> bool {
        !self.configured.is_empty()
    }

    /// Add a server, replacing one with the same login URL.
    pub fn add_configured(&mut self, server: Server) {
        match self
            .configured
            .iter_mut()
            .find(|s| s.login_url() == server.login_url())
        {
            Some(existing) => *existing = server,
            None => self.configured.push(server),
        }
    }

    pub fn remove_configured(&mut self, login_url: &str) -> Option<Server> {
        let index = self
            .configured
            .iter()
            .position(|s| s.login_url() == login_url)?;
        Some(self.configured.remove(index))
    }

    pub fn configured_by_login_url(&self, login_url: &str) -> Option<&Server> {
        self.configured.iter().find(|s| s.login_url() == login_url)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Search
    // ─────────────────────────────────────────────────────────────────────────

    /// Institute access servers and organizations matching `query`.
    ///
    /// Every call filters the current snapshot again; an empty query yields
    /// everything.
    pub fn search_predefined<'a>(&'a self, query: &'a str) -> impl Iterator<Item = Server> + 'a {
        let institutes = self
            .snapshot
            .institutes
            .iter()
            .cloned()
            .map(Server::InstituteAccess);
        let organizations = self
            .snapshot
            .organizations
            .iter()
            .cloned()
            .map(Server::Organization);
        institutes
            .chain(organizations)
            .filter(move |server| server.matches(query))
    }

    /// A custom server for a URL typed by the user.
    pub fn search_custom(&self, query: &str) -> std::iter::Once<Server> {
        std::iter::once(Server::Custom(CustomServer::from_input(query)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Secure internet
    // ─────────────────────────────────────────────────────────────────────────

    pub fn secure_internet_locations(&self) -> &[SecureInternetServer] {
        &self.snapshot.locations
    }

    pub fn location_by_country(&self, country_code: &str) -> Option<&SecureInternetServer> {
        self.snapshot
            .locations
            .iter()
            .find(|l| l.country_code.eq_ignore_ascii_case(country_code))
    }

    /// The location hosting an organization's secure internet home.
    pub fn home_server_for(&self, org: &Organization) -> Option<SecureInternetServer> {
        self.snapshot
            .locations
            .iter()
            .find(|l| l.base_url == org.secure_internet_home)
            .map(|l| l.via(org))
    }

    /// Every location, as reached through `org`.
    pub fn locations_for(&self, org: &Organization) -> Vec<SecureInternetServer> {
        self.snapshot.locations.iter().map(|l| l.via(org)).collect()
    }

    /// Resolve a server's info document.
    pub async fn get_server_info(&self, api: &dyn ServerApi, server: &Server) -> Result<ServerInfo> {
        tracing::debug!(server = %server.base_url(), kind = %server.kind(), "Resolving server info");
        api.server_info(server.base_url()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstituteServer;

    fn institute(name: &str, url: &str) -> InstituteServer {
        InstituteServer {
            base_url: url.to_string(),
            display_name: name.into(),
            keywords: None,
            support_contacts: vec![],
        }
    }

    fn location(cc: &str) -> SecureInternetServer {
        SecureInternetServer {
            base_url: format!("https://{}.example.org/", cc.to_lowercase()),
            country_code: cc.to_string(),
            support_contacts: vec![],
            home_base_url: None,
            org_id: None,
        }
    }

    fn database() -> ServerDatabase {
        let mut db = ServerDatabase::new();
        db.replace_snapshot(DiscoverySnapshot {
            versions: DiscoveryVersions { server_list: 1, organization_list: 1 },
            institutes: vec![
                institute("Alpha University", "https://alpha.example.edu/"),
                institute("Beta College", "https://beta.example.edu/"),
            ],
            organizations: vec![Organization {
                org_id: "https://idp.gamma.example".to_string(),
                display_name: "Gamma Research".into(),
                keywords: Some("alpha-partner".into()),
                secure_internet_home: "https://nl.example.org/".to_string(),
            }],
            locations: vec![location("NL"), location("DE")],
        });
        db
    }

    #[test]
    fn test_search_is_case_insensitive_and_restartable() {
        let db = database();
        let names: Vec<String> = db
            .search_predefined("ALPHA")
            .map(|s| s.base_url().to_string())
            .collect();
        assert_eq!(names, vec!["https://alpha.example.edu/", "https://nl.example.org/"]);

        assert_eq!(db.search_predefined("").count(), 3);
        assert_eq!(db.search_predefined("").count(), 3);
        assert_eq!(db.search_predefined("nothing").count(), 0);
    }

    #[test]
    fn test_search_custom_yields_one_server() {
        let db = ServerDatabase::new();
        let found: Vec<Server> = db.search_custom("vpn.example.org").collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].login_url(), "https://vpn.example.org/");
    }

    #[test]
    fn test_refresh_replaces_snapshot_only() {
        let mut db = database();
        db.add_configured(Server::InstituteAccess(institute("Alpha", "https://alpha.example.edu/")));
        let old = db.snapshot();

        db.replace_snapshot(DiscoverySnapshot::default());
        assert_eq!(db.search_predefined("").count(), 0);
        assert_eq!(old.institutes.len(), 2);
        assert_eq!(db.all_configured().len(), 1);
        assert!(db.versions().is_none());
    }

    #[test]
    fn test_configured_servers_are_keyed_by_login_url() {
        let mut db = database();
        db.add_configured(Server::InstituteAccess(institute("One", "https://a.example/")));
        db.add_configured(Server::InstituteAccess(institute("Two", "https://a.example/")));
        assert_eq!(db.all_configured().len(), 1);

        let removed = db.remove_configured("https://a.example/").unwrap();
        assert_eq!(removed.display_name("en", crate::CountryNames::global()), "Two");
        assert!(!db.has_configured());
        assert!(db.remove_configured("https://a.example/").is_none());
    }

    #[test]
    fn test_locations_for_organization() {
        let db = database();
        let org = db.snapshot().organizations[0].clone();

        let home = db.home_server_for(&org).unwrap();
        assert_eq!(home.country_code, "NL");

        let locations = db.locations_for(&org);
        assert_eq!(locations.len(), 2);
        assert!(locations.iter().all(|l| l.home_base_url.as_deref() == Some("https://nl.example.org/")));
        assert_eq!(db.location_by_country("de").unwrap().country_code, "DE");
    }
}
