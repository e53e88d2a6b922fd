//! Authorization code + PKCE challenge.
//!
//! A [`Challenge`] is created per authorization attempt and consumed exactly
//! once: either a captured redirect is exchanged for a token, or the attempt
//! is cancelled. [`Authorizer`] ties a challenge to a [`CallbackServer`] and
//! the user's browser.

use std::sync::Arc;

use tokio::task::JoinHandle;
use url::Url;

use crate::browser::Browser;
use crate::callback::{CallbackParams, CallbackPaths, CallbackServer, StopHandle};
use crate::error::{OAuthError, Result};
use crate::pkce::{PkceChallenge, generate_state};
use crate::token::{OAuthToken, TokenClient};

/// Client-side OAuth settings shared by all servers.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub scope: String,
    pub paths: CallbackPaths,
}

impl Default for OAuthClientConfig {
    fn default() -> Self {
        Self {
            client_id: "org.eduvpn.app.linux".to_string(),
            scope: "config".to_string(),
            paths: CallbackPaths::default(),
        }
    }
}

/// Where a challenge is in its lifecycle. Both non-initial phases are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengePhase {
    Created,
    TokenFetched,
    Cancelled,
}

/// The result of a completed authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedSession {
    pub token: OAuthToken,
    pub token_endpoint: String,
    pub authorization_endpoint: String,
}

/// One authorization attempt.
pub struct Challenge {
    pkce: PkceChallenge,
    state: String,
    redirect_uri: String,
    token_endpoint: String,
    authorization_endpoint: String,
    authorization_url: String,
    phase: ChallengePhase,
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Challenge")
            .field("redirect_uri", &self.redirect_uri)
            .field("token_endpoint", &self.token_endpoint)
            .field("authorization_endpoint", &self.authorization_endpoint)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl Challenge {
    /// Generate a fresh verifier, challenge and state, and build the
    /// authorization URL.
    pub fn create(
        client: &OAuthClientConfig,
        redirect_uri: &str,
        token_endpoint: &str,
        authorization_endpoint: &str,
    ) -> Result<Self> {
        let pkce = PkceChallenge::generate();
        let state = generate_state();
        let authorization_url = build_authorization_url(
            authorization_endpoint,
            client,
            redirect_uri,
            &pkce.challenge,
            &state,
        )?;

        Ok(Self {
            pkce,
            state,
            redirect_uri: redirect_uri.to_string(),
            token_endpoint: token_endpoint.to_string(),
            authorization_endpoint: authorization_endpoint.to_string(),
            authorization_url,
            phase: ChallengePhase::Created,
        })
    }

    pub fn authorization_url(&self) -> &str {
        &self.authorization_url
    }

    /// The CSRF token the redirect must echo back.
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn code_challenge(&self) -> &str {
        &self.pkce.challenge
    }

    pub fn phase(&self) -> ChallengePhase {
        self.phase
    }

    /// Mark the attempt as abandoned.
    pub fn cancel(&mut self) {
        if self.phase == ChallengePhase::Created {
            self.phase = ChallengePhase::Cancelled;
        }
    }

    /// Validate the captured redirect and exchange its code for a token.
    ///
    /// The token endpoint is never contacted when the redirect's `state`
    /// does not match or the redirect is otherwise malformed.
    pub async fn complete(
        &mut self,
        params: &CallbackParams,
        tokens: &dyn TokenClient,
    ) -> Result<AuthorizedSession> {
        if self.phase != ChallengePhase::Created {
            return Err(OAuthError::Protocol(format!(
                "challenge already {:?}",
                self.phase
            )));
        }

        if let Some(error) = params.get("error") {
            self.phase = ChallengePhase::Cancelled;
            let description = params
                .get("error_description")
                .map(|d| format!(": {}", d))
                .unwrap_or_default();
            return Err(OAuthError::Protocol(format!(
                "authorization server returned {}{}",
                error, description
            )));
        }

        let Some(state) = params.get("state") else {
            self.phase = ChallengePhase::Cancelled;
            return Err(OAuthError::Protocol("redirect is missing state".to_string()));
        };
        if state != &self.state {
            self.phase = ChallengePhase::Cancelled;
            tracing::warn!("Authorization redirect carried an unexpected state, aborting");
            return Err(OAuthError::StateMismatch);
        }

        let Some(code) = params.get("code").filter(|c| !c.is_empty()) else {
            self.phase = ChallengePhase::Cancelled;
            return Err(OAuthError::Protocol("redirect is missing code".to_string()));
        };

        let token = tokens
            .fetch_token(
                &self.token_endpoint,
                code,
                &self.pkce.verifier,
                &self.redirect_uri,
            )
            .await?;
        self.phase = ChallengePhase::TokenFetched;

        Ok(AuthorizedSession {
            token,
            token_endpoint: self.token_endpoint.clone(),
            authorization_endpoint: self.authorization_endpoint.clone(),
        })
    }
}

/// Build the authorization URL for the OAuth flow.
pub fn build_authorization_url(
    authorization_endpoint: &str,
    client: &OAuthClientConfig,
    redirect_uri: &str,
    challenge: &str,
    state: &str,
) -> Result<String> {
    let mut url = Url::parse(authorization_endpoint)?;
    url.query_pairs_mut()
        .append_pair("client_id", &client.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", &client.scope)
        .append_pair("code_challenge_method", "S256")
        .append_pair("code_challenge", challenge)
        .append_pair("state", state);
    Ok(url.into())
}

/// An authorization running in the background.
#[derive(Debug)]
pub struct PendingAuthorization {
    /// Cancels the pending callback listener.
    pub stop: StopHandle,
    /// The URL the browser was pointed at.
    pub authorization_url: String,
    /// The task awaiting the redirect.
    pub task: JoinHandle<()>,
}

/// Runs authorization challenges with a token client and a browser.
#[derive(Debug, Clone)]
pub struct Authorizer {
    client: OAuthClientConfig,
    tokens: Arc<dyn TokenClient>,
    browser: Arc<dyn Browser>,
}

impl Authorizer {
    pub fn new(
        client: OAuthClientConfig,
        tokens: Arc<dyn TokenClient>,
        browser: Arc<dyn Browser>,
    ) -> Self {
        Self {
            client,
            tokens,
            browser,
        }
    }

    pub fn token_client(&self) -> &Arc<dyn TokenClient> {
        &self.tokens
    }

    /// Authorize and wait for the outcome. `None` means the user cancelled.
    pub async fn run_challenge(
        &self,
        token_endpoint: &str,
        authorization_endpoint: &str,
    ) -> Result<Option<AuthorizedSession>> {
        let server = CallbackServer::start_with_paths(self.client.paths.clone()).await?;
        let mut challenge = Challenge::create(
            &self.client,
            &server.success_url(),
            token_endpoint,
            authorization_endpoint,
        )?;

        if let Err(e) = self.browser.open(challenge.authorization_url()) {
            // Unblock and close the listener before giving up.
            server.stop_handle().stop();
            let _ = server.run().await;
            return Err(e);
        }

        finish(server, &mut challenge, self.tokens.as_ref()).await
    }

    /// Start an authorization and return immediately.
    ///
    /// `callback` runs on a background task once the redirect arrived, the
    /// listener was cancelled, or the exchange failed.
    pub async fn run_challenge_in_background<F>(
        &self,
        token_endpoint: &str,
        authorization_endpoint: &str,
        callback: F,
    ) -> Result<PendingAuthorization>
    where
        F: FnOnce(Result<Option<AuthorizedSession>>) + Send + 'static,
    {
        let server = CallbackServer::start_with_paths(self.client.paths.clone()).await?;
        let mut challenge = Challenge::create(
            &self.client,
            &server.success_url(),
            token_endpoint,
            authorization_endpoint,
        )?;
        let stop = server.stop_handle();
        let authorization_url = challenge.authorization_url().to_string();

        if let Err(e) = self.browser.open(&authorization_url) {
            tracing::warn!(error = %e, "Could not open the browser; the URL must be opened manually");
        }

        let tokens = self.tokens.clone();
        let task = tokio::spawn(async move {
            let result = finish(server, &mut challenge, tokens.as_ref()).await;
            callback(result);
        });

        Ok(PendingAuthorization {
            stop,
            authorization_url,
            task,
        })
    }
}

async fn finish(
    server: CallbackServer,
    challenge: &mut Challenge,
    tokens: &dyn TokenClient,
) -> Result<Option<AuthorizedSession>> {
    match server.run().await? {
        None => {
            challenge.cancel();
            tracing::info!("Authorization cancelled");
            Ok(None)
        }
        Some(params) => challenge.complete(&params, tokens).await.map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Token client double that records every exchange.
    #[derive(Debug, Default)]
    struct RecordingTokens {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TokenClient for RecordingTokens {
        async fn fetch_token(
            &self,
            _token_endpoint: &str,
            code: &str,
            verifier: &str,
            _redirect_uri: &str,
        ) -> Result<OAuthToken> {
            self.calls.lock().push((code.to_string(), verifier.to_string()));
            Ok(OAuthToken {
                access_token: format!("access-for-{}", code),
                refresh_token: "refresh".to_string(),
                token_type: "bearer".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }

        async fn refresh_token(
            &self,
            _token_endpoint: &str,
            token: &OAuthToken,
        ) -> Result<OAuthToken> {
            Ok(token.clone())
        }
    }

    /// Browser double that follows the redirect with the given code.
    #[derive(Debug)]
    struct RedirectingBrowser {
        code: &'static str,
        tamper_state: bool,
    }

    impl Browser for RedirectingBrowser {
        fn open(&self, url: &str) -> Result<()> {
            let url = Url::parse(url)?;
            let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
            let mut state = query["state"].clone();
            if self.tamper_state {
                state.push('x');
            }
            let redirect = format!(
                "{}?code={}&state={}",
                query["redirect_uri"],
                self.code,
                urlencode(&state)
            );
            tokio::spawn(async move {
                let _ = reqwest::get(redirect).await;
            });
            Ok(())
        }
    }

    fn urlencode(value: &str) -> String {
        url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
    }

    fn params(pairs: &[(&str, &str)]) -> CallbackParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn challenge() -> Challenge {
        Challenge::create(
            &OAuthClientConfig::default(),
            "http://127.0.0.1:4242/callback",
            "https://vpn.example.org/oauth/token",
            "https://vpn.example.org/oauth/authorize",
        )
        .unwrap()
    }

    #[test]
    fn test_authorization_url_parameters() {
        let challenge = challenge();
        let url = Url::parse(challenge.authorization_url()).unwrap();
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/oauth/authorize");
        assert_eq!(query["client_id"], "org.eduvpn.app.linux");
        assert_eq!(query["redirect_uri"], "http://127.0.0.1:4242/callback");
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["scope"], "config");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["code_challenge"], challenge.code_challenge());
        assert_eq!(query["state"], challenge.state());
    }

    #[test]
    fn test_authorization_url_keeps_existing_query() {
        let url = build_authorization_url(
            "https://idp.example.org/authorize?tenant=a",
            &OAuthClientConfig::default(),
            "http://127.0.0.1:1/callback",
            "c",
            "s",
        )
        .unwrap();
        assert!(url.starts_with("https://idp.example.org/authorize?tenant=a&client_id="));
    }

    #[tokio::test]
    async fn test_state_mismatch_never_fetches_token() {
        let tokens = RecordingTokens::default();
        let mut challenge = challenge();

        let err = challenge
            .complete(&params(&[("code", "c"), ("state", "forged")]), &tokens)
            .await
            .unwrap_err();

        assert!(matches!(err, OAuthError::StateMismatch));
        assert!(tokens.calls.lock().is_empty());
        assert_eq!(challenge.phase(), ChallengePhase::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_code_is_protocol_violation() {
        let tokens = RecordingTokens::default();
        let mut challenge = challenge();
        let state = challenge.state().to_string();

        let err = challenge
            .complete(&params(&[("state", &state)]), &tokens)
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(tokens.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_error_redirect_is_protocol_violation() {
        let tokens = RecordingTokens::default();
        let mut challenge = challenge();

        let err = challenge
            .complete(&params(&[("error", "access_denied")]), &tokens)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("access_denied"));
        assert!(tokens.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_complete_exchanges_once() {
        let tokens = RecordingTokens::default();
        let mut challenge = challenge();
        let state = challenge.state().to_string();
        let redirect = params(&[("code", "the-code"), ("state", &state)]);

        let session = challenge.complete(&redirect, &tokens).await.unwrap();
        assert_eq!(session.token.access_token, "access-for-the-code");
        assert_eq!(session.token_endpoint, "https://vpn.example.org/oauth/token");
        assert_eq!(challenge.phase(), ChallengePhase::TokenFetched);

        // The verifier sent is the one the challenge was derived from.
        let (_, verifier) = tokens.calls.lock()[0].clone();
        assert_eq!(
            crate::pkce::generate_code_challenge(&verifier),
            challenge.code_challenge()
        );

        // A consumed challenge cannot be replayed.
        assert!(challenge.complete(&redirect, &tokens).await.is_err());
        assert_eq!(tokens.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_run_challenge_with_redirect() {
        let tokens = Arc::new(RecordingTokens::default());
        let authorizer = Authorizer::new(
            OAuthClientConfig::default(),
            tokens.clone(),
            Arc::new(RedirectingBrowser {
                code: "browser-code",
                tamper_state: false,
            }),
        );

        let session = authorizer
            .run_challenge("https://vpn.example.org/token", "https://vpn.example.org/authorize")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.token.access_token, "access-for-browser-code");
    }

    #[tokio::test]
    async fn test_run_challenge_detects_forged_state() {
        let tokens = Arc::new(RecordingTokens::default());
        let authorizer = Authorizer::new(
            OAuthClientConfig::default(),
            tokens.clone(),
            Arc::new(RedirectingBrowser {
                code: "browser-code",
                tamper_state: true,
            }),
        );

        let err = authorizer
            .run_challenge("https://vpn.example.org/token", "https://vpn.example.org/authorize")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::StateMismatch));
        assert!(tokens.calls.lock().is_empty());
    }

    #[derive(Debug)]
    struct IdleBrowser;

    impl Browser for IdleBrowser {
        fn open(&self, _url: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_background_challenge_cancel() {
        let authorizer = Authorizer::new(
            OAuthClientConfig::default(),
            Arc::new(RecordingTokens::default()),
            Arc::new(IdleBrowser),
        );
        let (tx, rx) = tokio::sync::oneshot::channel();

        let pending = authorizer
            .run_challenge_in_background(
                "https://vpn.example.org/token",
                "https://vpn.example.org/authorize",
                move |result| {
                    let _ = tx.send(result);
                },
            )
            .await
            .unwrap();
        assert!(pending.authorization_url.contains("code_challenge_method=S256"));

        pending.stop.stop();
        let result = rx.await.unwrap().unwrap();
        assert!(result.is_none());
    }
}
