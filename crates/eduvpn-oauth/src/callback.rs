//! Loopback HTTP listener that captures the OAuth redirect.
//!
//! The listener binds an OS-assigned port on `127.0.0.1`, serves exactly one
//! meaningful request (the redirect or an explicit cancel) and then shuts
//! down, so the port is closed again by the time [`CallbackServer::run`]
//! returns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    response::Html,
    routing::get,
};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{OAuthError, Result};

/// Query parameters captured from the redirect.
pub type CallbackParams = HashMap<String, String>;

/// Outcome of a single callback listener run: `None` means cancelled.
pub type CallbackResult = Result<Option<CallbackParams>>;

/// Page served to the browser once the redirect (or cancel) was captured.
const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>eduVPN</title>
<style>body { font-family: sans-serif; text-align: center; margin-top: 4em; }</style>
</head>
<body>
<h1>You may now close this window.</h1>
<p>Return to the VPN client to continue.</p>
</body>
</html>
"#;

/// Request paths the listener answers on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPaths {
    pub callback: String,
    pub cancel: String,
}

impl Default for CallbackPaths {
    fn default() -> Self {
        Self {
            callback: "/callback".to_string(),
            cancel: "/cancel".to_string(),
        }
    }
}

/// Shared handler state: the one-shot slot the first request fills.
struct CallbackState {
    result: Mutex<Option<oneshot::Sender<Option<CallbackParams>>>>,
}

impl CallbackState {
    /// Record the outcome. Later requests find the slot empty and are ignored.
    fn record(&self, outcome: Option<CallbackParams>) {
        if let Some(tx) = self.result.lock().take() {
            let _ = tx.send(outcome);
        } else {
            tracing::debug!("Ignoring callback request after the result was recorded");
        }
    }
}

/// A bound, not yet running callback listener.
#[derive(Debug)]
pub struct CallbackServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    paths: CallbackPaths,
}

impl CallbackServer {
    /// Bind a listener on an ephemeral loopback port with the default paths.
    pub async fn start() -> Result<Self> {
        Self::start_with_paths(CallbackPaths::default()).await
    }

    /// Bind a listener on an ephemeral loopback port.
    pub async fn start_with_paths(paths: CallbackPaths) -> Result<Self> {
        for path in [&paths.callback, &paths.cancel] {
            if !path.starts_with('/') {
                return Err(OAuthError::Listener(format!(
                    "callback path '{}' must start with '/'",
                    path
                )));
            }
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| OAuthError::Listener(format!("failed to bind loopback port: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| OAuthError::Listener(e.to_string()))?;
        tracing::debug!(addr = %local_addr, "Callback listener bound");

        Ok(Self {
            listener,
            local_addr,
            paths,
        })
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The redirect URI to register with the authorization request.
    pub fn success_url(&self) -> String {
        format!("http://{}{}", self.local_addr, self.paths.callback)
    }

    /// The URL that cancels a pending [`run`](Self::run).
    pub fn cancel_url(&self) -> String {
        format!("http://{}{}", self.local_addr, self.paths.cancel)
    }

    /// A handle that can cancel the listener from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cancel_url: self.cancel_url(),
            http: reqwest::Client::new(),
        }
    }

    /// Wait for the redirect or a cancel request.
    ///
    /// Returns the redirect's query parameters, or `None` when the cancel
    /// path was requested. The listener is closed before this returns, on
    /// every path.
    pub async fn run(self) -> CallbackResult {
        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = Arc::new(CallbackState {
            result: Mutex::new(Some(result_tx)),
        });
        let router = Router::new()
            .route(&self.paths.callback, get(handle_callback))
            .route(&self.paths.cancel, get(handle_cancel))
            .with_state(state);

        let addr = self.local_addr;
        let server = tokio::spawn(async move {
            axum::serve(self.listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        });

        // The sender lives in the router state, so this resolves either with
        // the first recorded outcome or with an error once the server died.
        let outcome = result_rx.await;
        let _ = shutdown_tx.send(());

        let served = server
            .await
            .map_err(|e| OAuthError::Listener(format!("callback listener task failed: {}", e)))?;
        tracing::debug!(addr = %addr, "Callback listener closed");

        match (outcome, served) {
            (Ok(outcome), _) => Ok(outcome),
            (Err(_), Err(e)) => Err(OAuthError::Listener(e.to_string())),
            (Err(_), Ok(())) => Err(OAuthError::Listener(
                "callback listener stopped without a result".to_string(),
            )),
        }
    }

    /// Run the listener on a background task and hand the outcome to
    /// `callback`, which is invoked on that task.
    pub fn run_in_background<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(CallbackResult) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.run().await;
            callback(result);
        })
    }
}

/// Cancels a pending callback listener by requesting its cancel URL.
#[derive(Debug, Clone)]
pub struct StopHandle {
    cancel_url: String,
    http: reqwest::Client,
}

impl StopHandle {
    /// The cancel URL this handle requests.
    pub fn cancel_url(&self) -> &str {
        &self.cancel_url
    }

    /// Request the cancel URL from a separate task.
    ///
    /// Harmless when the listener already finished: the refused connection
    /// is ignored. Must be called from within a tokio runtime.
    pub fn stop(&self) -> JoinHandle<()> {
        let http = self.http.clone();
        let url = self.cancel_url.clone();
        tokio::spawn(async move {
            if let Err(e) = http.get(&url).send().await {
                tracing::debug!(error = %e, "Cancel request not delivered; listener already closed");
            }
        })
    }
}

/// Handle GET on the callback path.
async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    state.record(Some(params));
    Html(LANDING_PAGE)
}

/// Handle GET on the cancel path.
async fn handle_cancel(State(state): State<Arc<CallbackState>>) -> Html<&'static str> {
    state.record(None);
    Html(LANDING_PAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_urls_embed_bound_port() {
        let server = CallbackServer::start().await.unwrap();
        let port = server.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(
            server.success_url(),
            format!("http://127.0.0.1:{}/callback", port)
        );
        assert_eq!(server.cancel_url(), format!("http://127.0.0.1:{}/cancel", port));
    }

    #[tokio::test]
    async fn test_invalid_path_rejected() {
        let paths = CallbackPaths {
            callback: "callback".to_string(),
            cancel: "/cancel".to_string(),
        };
        let err = CallbackServer::start_with_paths(paths).await.unwrap_err();
        assert!(matches!(err, OAuthError::Listener(_)));
    }

    #[tokio::test]
    async fn test_callback_captures_query() {
        let server = CallbackServer::start().await.unwrap();
        let url = format!("{}?code=abc&state=xyz", server.success_url());
        let run = tokio::spawn(server.run());

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/html"));
        assert!(response.text().await.unwrap().contains("close this window"));

        let params = run.await.unwrap().unwrap().unwrap();
        assert_eq!(params.get("code").map(String::as_str), Some("abc"));
        assert_eq!(params.get("state").map(String::as_str), Some("xyz"));
    }

    #[tokio::test]
    async fn test_cancel_returns_none() {
        let server = CallbackServer::start().await.unwrap();
        let cancel = server.cancel_url();
        let run = tokio::spawn(server.run());

        let response = reqwest::get(&cancel).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(run.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_handle_cancels() {
        let server = CallbackServer::start().await.unwrap();
        let stop = server.stop_handle();
        let run = tokio::spawn(server.run());

        stop.stop().await.unwrap();
        assert!(run.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_after_completion_is_noop() {
        let server = CallbackServer::start().await.unwrap();
        let stop = server.stop_handle();
        let url = format!("{}?code=c&state=s", server.success_url());
        let run = tokio::spawn(server.run());

        reqwest::get(&url).await.unwrap();
        assert!(run.await.unwrap().unwrap().is_some());

        // Must neither panic nor error.
        stop.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_serves_exactly_once() {
        let server = CallbackServer::start().await.unwrap();
        let url = format!("{}?code=c&state=s", server.success_url());
        let result = server.run_in_background(|_| {});

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .unwrap();
        client.get(&url).send().await.unwrap();
        result.await.unwrap();

        let second = client.get(&url).send().await;
        assert!(second.is_err(), "listener must be closed after one request");
    }

    #[tokio::test]
    async fn test_unknown_path_does_not_consume_result() {
        let server = CallbackServer::start().await.unwrap();
        let base = format!("http://{}", server.local_addr());
        let cancel = server.cancel_url();
        let run = tokio::spawn(server.run());

        let response = reqwest::get(format!("{}/favicon.ico", base)).await.unwrap();
        assert_eq!(response.status(), 404);

        reqwest::get(&cancel).await.unwrap();
        assert!(run.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_in_background_invokes_callback() {
        let server = CallbackServer::start().await.unwrap();
        let url = format!("{}?code=bg&state=s", server.success_url());
        let (tx, rx) = oneshot::channel();
        server.run_in_background(move |result| {
            let _ = tx.send(result);
        });

        reqwest::get(&url).await.unwrap();
        let params = rx.await.unwrap().unwrap().unwrap();
        assert_eq!(params.get("code").map(String::as_str), Some("bg"));
    }
}
