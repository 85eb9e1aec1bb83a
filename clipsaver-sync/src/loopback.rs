//! Installed-app OAuth flow: a one-shot HTTP listener on the loopback
//! interface receives the authorization redirect from the browser.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    extract::{Query, State},
    response::Html,
    routing::get,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use clipsaver_core::UserToken;
use futures::future::BoxFuture;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{info, warn};
use url::Url;

use crate::{
    SyncError,
    auth::{AuthorizationRequest, Authorizer, InstalledClient, post_token_form},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

type CallbackSlot = Arc<Mutex<Option<oneshot::Sender<HashMap<String, String>>>>>;

#[derive(Debug, Clone)]
pub struct LoopbackAuthorizer {
    timeout: Duration,
    open_browser: bool,
}

impl Default for LoopbackAuthorizer {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            open_browser: true,
        }
    }
}

impl LoopbackAuthorizer {
    #[must_use]
    pub fn new(timeout: Duration, open_browser: bool) -> Self {
        Self {
            timeout,
            open_browser,
        }
    }

    async fn run(&self, request: AuthorizationRequest<'_>) -> Result<UserToken, SyncError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| SyncError::AuthHandshakeFailed(format!("loopback bind failed: {err}")))?;
        let port = listener
            .local_addr()
            .map_err(|err| SyncError::AuthHandshakeFailed(err.to_string()))?
            .port();
        let redirect_uri = format!("http://127.0.0.1:{port}/");

        let verifier = pkce_verifier();
        let state = random_token(16);
        let url = authorization_url(
            request.auth_uri,
            &request.client.client_id,
            &redirect_uri,
            request.scopes,
            &state,
            &pkce_challenge(&verifier),
        )?;

        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let slot: CallbackSlot = Arc::new(Mutex::new(Some(result_tx)));
        let app = Router::new()
            .route("/", get(callback_handler))
            .with_state(slot);
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        });

        info!(port, "waiting for browser authorization");
        if self.open_browser {
            if let Err(err) = open::that(url.as_str()) {
                warn!("could not open browser ({err}); visit {url} manually");
            }
        } else {
            info!("visit {url} to authorize");
        }

        let outcome = tokio::time::timeout(self.timeout, result_rx).await;
        let _ = shutdown_tx.send(());
        if let Err(err) = server.await {
            warn!("loopback server task failed: {err}");
        }

        let params = match outcome {
            Ok(Ok(params)) => params,
            Ok(Err(_)) => {
                return Err(SyncError::AuthHandshakeFailed(
                    "callback listener closed".to_owned(),
                ));
            }
            Err(_) => {
                return Err(SyncError::AuthHandshakeFailed(format!(
                    "no authorization received within {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        let code = validate_callback(&params, &state)?;
        exchange_code(
            request.http,
            request.client,
            request.token_uri,
            &code,
            &verifier,
            &redirect_uri,
        )
        .await
    }
}

impl Authorizer for LoopbackAuthorizer {
    fn authorize<'a>(
        &'a self,
        request: AuthorizationRequest<'a>,
    ) -> BoxFuture<'a, Result<UserToken, SyncError>> {
        Box::pin(self.run(request))
    }
}

async fn callback_handler(
    State(slot): State<CallbackSlot>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    let failed = params.contains_key("error");
    let sender = slot.lock().ok().and_then(|mut guard| guard.take());
    if let Some(tx) = sender {
        let _ = tx.send(params);
    }
    if failed {
        Html("<html><body><h1>Authorization failed</h1><p>You can close this window.</p></body></html>")
    } else {
        Html("<html><body><h1>ClipSaver is authorized</h1><p>You can close this window.</p></body></html>")
    }
}

/// Checks the redirect parameters and returns the authorization code.
pub fn validate_callback(
    params: &HashMap<String, String>,
    expected_state: &str,
) -> Result<String, SyncError> {
    if let Some(error) = params.get("error") {
        return Err(SyncError::AuthHandshakeFailed(format!(
            "authorization denied: {error}"
        )));
    }
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Err(SyncError::AuthHandshakeFailed(
            "state parameter mismatch".to_owned(),
        ));
    }
    params
        .get("code")
        .filter(|code| !code.is_empty())
        .cloned()
        .ok_or_else(|| SyncError::AuthHandshakeFailed("missing authorization code".to_owned()))
}

pub fn authorization_url(
    auth_uri: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[&str],
    state: &str,
    code_challenge: &str,
) -> Result<Url, SyncError> {
    let scope = scopes.join(" ");
    Url::parse_with_params(
        auth_uri,
        &[
            ("response_type", "code"),
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
            ("state", state),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|err| SyncError::AuthHandshakeFailed(format!("bad auth uri {auth_uri}: {err}")))
}

pub fn pkce_verifier() -> String {
    random_token(32)
}

pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0_u8; len];
    rand::rng().fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(bytes)
}

async fn exchange_code(
    http: &reqwest::Client,
    client: &InstalledClient,
    token_uri: &str,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<UserToken, SyncError> {
    let now = Utc::now();
    let response = post_token_form(
        http,
        token_uri,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("redirect_uri", redirect_uri),
            ("client_id", &client.client_id),
            ("client_secret", &client.client_secret),
        ],
    )
    .await?;
    Ok(response.into_user_token(now, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_matches_rfc7636_vector() {
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_is_url_safe_and_long_enough() {
        let verifier = pkce_verifier();
        assert!(verifier.len() >= 43);
        assert!(
            verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn authorization_url_carries_pkce_and_offline_access() {
        let url = authorization_url(
            "https://accounts.example.test/o/oauth2/auth",
            "client-1",
            "http://127.0.0.1:5000/",
            &["scope-a", "scope-b"],
            "st4te",
            "chal",
        )
        .unwrap();
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "client-1");
        assert_eq!(pairs["redirect_uri"], "http://127.0.0.1:5000/");
        assert_eq!(pairs["scope"], "scope-a scope-b");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["access_type"], "offline");
        assert_eq!(pairs["state"], "st4te");
    }

    #[test]
    fn callback_requires_matching_state_and_code() {
        let mut params = HashMap::new();
        params.insert("state".to_owned(), "abc".to_owned());
        params.insert("code".to_owned(), "the-code".to_owned());
        assert_eq!(validate_callback(&params, "abc").unwrap(), "the-code");
        assert!(validate_callback(&params, "other").is_err());

        params.remove("code");
        assert!(validate_callback(&params, "abc").is_err());

        params.insert("error".to_owned(), "access_denied".to_owned());
        let err = validate_callback(&params, "abc").unwrap_err();
        assert!(err.to_string().contains("access_denied"));
    }

    #[tokio::test]
    async fn times_out_without_a_callback() {
        let client = InstalledClient {
            client_id: "id".to_owned(),
            client_secret: "secret".to_owned(),
            auth_uri: None,
            token_uri: None,
        };
        let http = reqwest::Client::new();
        let authorizer = LoopbackAuthorizer::new(Duration::from_millis(50), false);
        let err = authorizer
            .authorize(AuthorizationRequest {
                client: &client,
                auth_uri: "http://127.0.0.1:1/o/oauth2/auth",
                token_uri: "http://127.0.0.1:1/token",
                scopes: &["scope"],
                http: &http,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AuthHandshakeFailed(_)));
    }
}
