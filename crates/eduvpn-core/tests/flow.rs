//! End-to-end connection flows against a mocked VPN server.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use common::{Harness, Options, VpnServer, calls, count};
use eduvpn_core::{
    ApplicationModel, CoreError, Edge, ErrorKind, InterfaceState, InterfaceStateKind, MetadataMap,
    MetadataStore, NetworkStateKind, Observable, Result, ServerMetadata,
};
use eduvpn_oauth::{TokenMap, TokenStore};

type Outcome = Arc<Mutex<Option<Result<()>>>>;

fn recorder() -> (Outcome, impl FnOnce(Result<()>) + Send + 'static) {
    let outcome = Outcome::default();
    let slot = outcome.clone();
    (outcome, move |result| *slot.lock() = Some(result))
}

fn discovery_loaded(model: &ApplicationModel) -> bool {
    model.database().has_discovery()
}

fn connected(model: &ApplicationModel) -> bool {
    model.is_connected() && model.interface_state().kind() == InterfaceStateKind::ConnectionStatus
}

async fn connect_fresh(server: &VpnServer, harness: &mut Harness) -> Outcome {
    harness.model.start();
    harness.settle(discovery_loaded).await;
    assert_eq!(
        harness.model.interface_state().kind(),
        InterfaceStateKind::SearchResults
    );

    let (outcome, callback) = recorder();
    harness
        .model
        .connect(server.institute(), callback, true)
        .unwrap();
    harness.settle(connected).await;
    outcome
}

#[tokio::test]
async fn test_first_connection_authorizes_and_activates() {
    let server = VpnServer::start().await;
    let mut harness = Harness::new(&server, Options::default());

    let chose_profile = Arc::new(AtomicBool::new(false));
    let flag = chose_profile.clone();
    harness.model.subscribe_interface(
        InterfaceStateKind::ChooseProfile,
        Edge::Enter,
        move |_| flag.store(true, Ordering::SeqCst),
    );

    let outcome = connect_fresh(&server, &mut harness).await;

    assert!(matches!(*outcome.lock(), Some(Ok(()))));
    assert!(!chose_profile.load(Ordering::SeqCst));
    assert!(harness.model.has_token(&server.institute()));
    assert!(harness.model.session_validity().is_some());

    let InterfaceState::ConnectionStatus { profile, .. } = harness.model.interface_state() else {
        panic!("expected connection status");
    };
    assert_eq!(profile.as_ref().map(|p| p.id.as_str()), Some("internet"));

    let log = calls(&harness.log);
    let browser = log.iter().position(|c| c == "browser").unwrap();
    let save = log.iter().position(|c| c.starts_with("save")).unwrap();
    let activate = log.iter().position(|c| c.starts_with("activate")).unwrap();
    assert!(browser < save && save < activate, "unexpected order: {:?}", log);

    let saved = harness.backend.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].profile_id, "internet");
    assert!(saved[0].config.starts_with("client"));

    let entry = &harness.model.metadata()[server.institute().login_url()];
    assert_eq!(entry.profile_id.as_deref(), Some("internet"));
    assert!(entry.validity_end.is_some());
}

#[tokio::test]
async fn test_renewal_disconnects_before_authorizing() {
    let server = VpnServer::start().await;
    let mut harness = Harness::new(&server, Options::default());
    connect_fresh(&server, &mut harness).await;

    harness.model.renew_session().unwrap();
    assert_eq!(
        harness.model.network_state().kind(),
        NetworkStateKind::Disconnected
    );
    harness.settle(connected).await;

    let log = calls(&harness.log);
    let deactivate = log.iter().position(|c| c.starts_with("deactivate")).unwrap();
    let second_browser = log.iter().rposition(|c| c == "browser").unwrap();
    let second_activate = log.iter().rposition(|c| c.starts_with("activate")).unwrap();
    assert_eq!(count(&harness.log, "browser"), 2);
    assert!(
        deactivate < second_browser && second_browser < second_activate,
        "unexpected order: {:?}",
        log
    );
    assert_eq!(server.requests_to("/api/v3/disconnect").await, 1);
}

#[tokio::test]
async fn test_stored_token_skips_the_browser() {
    let server = VpnServer::start().await;
    let mut tokens = TokenMap::new();
    tokens.insert(server.base_url(), server.stored_token());
    let mut harness = Harness::new(
        &server,
        Options {
            tokens,
            ..Default::default()
        },
    );

    let outcome = connect_fresh(&server, &mut harness).await;

    assert!(matches!(*outcome.lock(), Some(Ok(()))));
    assert_eq!(count(&harness.log, "browser"), 0);
    assert_eq!(count(&harness.log, "activate"), 1);
}

#[tokio::test]
async fn test_rejected_grant_authorizes_again() {
    let server = VpnServer::start().await;
    server.reject_next_refresh().await;
    let mut tokens = TokenMap::new();
    tokens.insert(server.base_url(), server.stored_token());
    let mut harness = Harness::new(
        &server,
        Options {
            tokens,
            ..Default::default()
        },
    );

    let outcome = connect_fresh(&server, &mut harness).await;

    assert!(matches!(*outcome.lock(), Some(Ok(()))));
    assert_eq!(count(&harness.log, "browser"), 1);
    let stored = harness.token_store.load_all().await.unwrap();
    assert_eq!(stored[&server.base_url()].token.access_token, "access-1");
}

#[tokio::test]
async fn test_startup_restores_an_active_connection() {
    let server = VpnServer::start().await;
    let now = Utc::now();
    let mut entry = ServerMetadata::new(server.institute(), "Example University");
    entry.profile_id = Some("internet".to_string());
    entry.validity_start = Some(now - chrono::Duration::hours(1));
    entry.validity_end = Some(now + chrono::Duration::hours(3));
    let mut metadata = MetadataMap::new();
    metadata.insert(server.base_url(), entry);

    let mut harness = Harness::new(
        &server,
        Options {
            metadata,
            active: Some(server.base_url()),
            ..Default::default()
        },
    );
    harness.model.start();
    harness
        .settle(|m| m.interface_state().kind() != InterfaceStateKind::Initial)
        .await;

    assert!(connected(&harness.model));
    let validity = harness.model.session_validity().unwrap();
    assert_eq!(validity.end(), now + chrono::Duration::hours(3));
    assert_eq!(harness.model.database().all_configured().len(), 1);
    assert_eq!(count(&harness.log, "activate"), 0);
}

#[tokio::test]
async fn test_cancelled_authorization_returns_home() {
    let server = VpnServer::start().await;
    let mut harness = Harness::new(
        &server,
        Options {
            manual_login: true,
            ..Default::default()
        },
    );
    harness.model.start();
    harness.settle(discovery_loaded).await;

    let (outcome, callback) = recorder();
    harness
        .model
        .connect(server.institute(), callback, true)
        .unwrap();
    harness
        .settle(|m| {
            matches!(
                m.interface_state(),
                InterfaceState::OAuthInProgress {
                    authorization_url: Some(_),
                    ..
                }
            )
        })
        .await;

    harness.model.cancel_oauth().unwrap();

    assert!(matches!(*outcome.lock(), Some(Err(CoreError::Cancelled))));
    assert_eq!(
        harness.model.interface_state().kind(),
        InterfaceStateKind::MainList
    );
    assert!(!harness.model.has_token(&server.institute()));

    // The listener's late cancel result belongs to the abandoned flow.
    harness.drain(std::time::Duration::from_millis(200)).await;
    assert_eq!(
        harness.model.interface_state().kind(),
        InterfaceStateKind::MainList
    );
    assert_eq!(count(&harness.log, "save"), 0);
}

#[tokio::test]
async fn test_expired_session_deactivates() {
    let server = VpnServer::start().await;
    let mut harness = Harness::new(&server, Options::default());
    connect_fresh(&server, &mut harness).await;

    let due = harness.model.tick(Utc::now() + chrono::Duration::hours(2));

    assert!(!due.is_empty());
    assert_eq!(
        harness.model.network_state().kind(),
        NetworkStateKind::CertificateExpired
    );
    assert_eq!(count(&harness.log, "deactivate"), 1);
    assert!(harness.model.tick(Utc::now() + chrono::Duration::hours(3)).is_empty());
}

#[tokio::test]
async fn test_disconnect_without_connection_fails() {
    let server = VpnServer::start().await;
    let mut harness = Harness::new(&server, Options::default());
    harness.model.start();
    harness.settle(discovery_loaded).await;

    let result = harness.model.disconnect(|_| {});
    assert!(matches!(result, Err(CoreError::NotConnected)));
}

#[tokio::test]
async fn test_disconnect_reaches_the_server() {
    let server = VpnServer::start().await;
    let mut harness = Harness::new(&server, Options::default());
    connect_fresh(&server, &mut harness).await;

    let (outcome, callback) = recorder();
    harness.model.disconnect(callback).unwrap();
    assert_eq!(
        harness.model.interface_state().kind(),
        InterfaceStateKind::MainList
    );
    let done = outcome.clone();
    harness.settle(move |_| done.lock().is_some()).await;

    assert!(matches!(*outcome.lock(), Some(Ok(()))));
    assert!(harness.model.is_disconnected());
    assert_eq!(server.requests_to("/api/v3/disconnect").await, 1);
}

#[tokio::test]
async fn test_unverifiable_first_discovery_shows_an_error() {
    let server = VpnServer::start().await;
    let mut harness = Harness::new(
        &server,
        Options {
            discovery_fails_after: Some(0),
            ..Default::default()
        },
    );
    harness.model.start();
    harness
        .settle(|m| m.interface_state().kind() == InterfaceStateKind::Error)
        .await;

    let InterfaceState::Error { error, previous } = harness.model.interface_state() else {
        panic!("expected an error state");
    };
    assert_eq!(error.kind, ErrorKind::Discovery);
    assert_eq!(previous.kind(), InterfaceStateKind::PendingSearch);
    assert!(!harness.model.database().has_discovery());

    // Retrying fetches again and fails the same way.
    harness.model.retry().unwrap();
    assert_eq!(
        harness.model.interface_state().kind(),
        InterfaceStateKind::PendingSearch
    );
    harness
        .settle(|m| m.interface_state().kind() == InterfaceStateKind::Error)
        .await;
}

#[tokio::test]
async fn test_failed_refresh_keeps_results_and_flags_them() {
    let server = VpnServer::start().await;
    let mut harness = Harness::new(
        &server,
        Options {
            manual_login: true,
            discovery_fails_after: Some(1),
            ..Default::default()
        },
    );
    harness.model.start();
    harness
        .settle(|m| m.interface_state().kind() == InterfaceStateKind::SearchResults)
        .await;

    // Abandoning a login returns to the search list, which refreshes discovery.
    let (_outcome, callback) = recorder();
    harness
        .model
        .connect(server.institute(), callback, false)
        .unwrap();
    harness
        .settle(|m| {
            matches!(
                m.interface_state(),
                InterfaceState::OAuthInProgress {
                    authorization_url: Some(_),
                    ..
                }
            )
        })
        .await;
    harness.model.cancel_oauth().unwrap();
    assert_eq!(
        harness.model.interface_state().kind(),
        InterfaceStateKind::SearchResults
    );
    harness
        .settle(|m| {
            matches!(
                m.interface_state(),
                InterfaceState::SearchResults {
                    refresh_error: Some(_),
                    ..
                }
            )
        })
        .await;

    let InterfaceState::SearchResults {
        results,
        refresh_error: Some(error),
        ..
    } = harness.model.interface_state()
    else {
        panic!("expected flagged search results");
    };
    assert_eq!(results, &vec![server.institute()]);
    assert_eq!(error.kind, ErrorKind::Discovery);
}

#[tokio::test]
async fn test_unusable_token_response_is_an_authorization_failure() {
    let server = VpnServer::start().await;
    server.serve_unusable_token_response().await;
    let mut harness = Harness::new(&server, Options::default());
    harness.model.start();
    harness.settle(discovery_loaded).await;

    let (outcome, callback) = recorder();
    harness
        .model
        .connect(server.institute(), callback, true)
        .unwrap();
    harness
        .settle(|m| m.interface_state().kind() == InterfaceStateKind::OAuthFailed)
        .await;

    let InterfaceState::OAuthFailed { error, .. } = harness.model.interface_state() else {
        panic!("expected an authorization failure");
    };
    assert_eq!(error.kind, ErrorKind::Authorization);
    assert!(matches!(
        *outcome.lock(),
        Some(Err(CoreError::Flow(ref e))) if e.kind == ErrorKind::Authorization
    ));
    assert!(!harness.model.has_token(&server.institute()));
    assert_eq!(count(&harness.log, "save"), 0);
}

#[tokio::test]
async fn test_connect_without_ensure_exists_leaves_server_unconfigured() {
    let server = VpnServer::start().await;
    let mut harness = Harness::new(&server, Options::default());
    harness.model.start();
    harness.settle(discovery_loaded).await;

    let (outcome, callback) = recorder();
    harness
        .model
        .connect(server.institute(), callback, false)
        .unwrap();
    harness.settle(connected).await;
    harness.model.flush().await;

    assert!(matches!(*outcome.lock(), Some(Ok(()))));
    assert!(harness.model.database().all_configured().is_empty());
    assert!(harness.metadata_store.load_all().await.unwrap().is_empty());
    assert!(harness.model.session_validity().is_some());
}

#[tokio::test]
async fn test_connect_with_ensure_exists_configures_server() {
    let server = VpnServer::start().await;
    let mut harness = Harness::new(&server, Options::default());
    connect_fresh(&server, &mut harness).await;
    harness.model.flush().await;

    assert_eq!(
        harness.model.database().all_configured(),
        &[server.institute()]
    );
    let stored = harness.metadata_store.load_all().await.unwrap();
    assert_eq!(
        stored[&server.base_url()].profile_id.as_deref(),
        Some("internet")
    );
}
