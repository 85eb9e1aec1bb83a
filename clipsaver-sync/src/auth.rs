//! Credential resolution for the two auth modes.
//!
//! Service mode signs a JWT with the service-account key and trades it for an
//! access token. OAuth mode works from a cached user token file: a valid token
//! is used as-is, an expired one is refreshed, and anything else goes through
//! the interactive [`Authorizer`]. Every new user token is written back to the
//! token file.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use clipsaver_core::{
    AuthMode, GOOGLE_SCOPES, SyncSettings, TOKEN_EXPIRY_SKEW_SECS, TokenState, UserToken,
    token_state,
};
use futures::future::BoxFuture;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Endpoints, SyncError};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const JWT_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

/// The `installed` (or `web`) block of an OAuth client secret file.
#[derive(Debug, Clone, Deserialize)]
pub struct InstalledClient {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub auth_uri: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretFile {
    #[serde(default)]
    installed: Option<InstalledClient>,
    #[serde(default)]
    web: Option<InstalledClient>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_user_token(self, now: DateTime<Utc>, previous_refresh: Option<String>) -> UserToken {
        UserToken {
            token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expiry: self.expires_in.map(|secs| now + Duration::seconds(secs)),
            scopes: self
                .scope
                .map(|s| s.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_else(|| GOOGLE_SCOPES.iter().map(|s| (*s).to_owned()).collect()),
        }
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_none_or(|at| at - Duration::seconds(TOKEN_EXPIRY_SKEW_SECS) > now)
    }
}

impl From<&UserToken> for AccessToken {
    fn from(token: &UserToken) -> Self {
        Self {
            value: token.token.clone(),
            expires_at: token.expiry,
        }
    }
}

/// Everything an interactive flow needs to obtain a user token.
pub struct AuthorizationRequest<'a> {
    pub client: &'a InstalledClient,
    pub auth_uri: &'a str,
    pub token_uri: &'a str,
    pub scopes: &'a [&'a str],
    pub http: &'a reqwest::Client,
}

/// Interactive authorization handshake, separated out so tests can stub it.
pub trait Authorizer: Send + Sync {
    fn authorize<'a>(
        &'a self,
        request: AuthorizationRequest<'a>,
    ) -> BoxFuture<'a, Result<UserToken, SyncError>>;
}

enum Credentials {
    Service {
        key: ServiceAccountKey,
        token_uri: String,
    },
    User {
        client: InstalledClient,
        auth_uri: String,
        token_uri: String,
        token_path: PathBuf,
        refresh_token: Option<String>,
        authorizer: Arc<dyn Authorizer>,
    },
}

/// Hands out access tokens, re-acquiring them shortly before they expire.
pub struct Authenticator {
    http: reqwest::Client,
    mode: AuthMode,
    state: Mutex<(Credentials, Option<AccessToken>)>,
}

impl Authenticator {
    pub async fn resolve(
        settings: &SyncSettings,
        endpoints: &Endpoints,
        http: reqwest::Client,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, SyncError> {
        let mut credentials = match settings.auth_mode {
            AuthMode::Service => {
                let key = load_service_account(Path::new(&settings.credentials_file))?;
                let token_uri = key
                    .token_uri
                    .clone()
                    .unwrap_or_else(|| endpoints.token_uri.clone());
                Credentials::Service { key, token_uri }
            }
            AuthMode::Oauth => {
                let client = load_client_secret(Path::new(&settings.client_secret_file))?;
                Credentials::User {
                    auth_uri: client
                        .auth_uri
                        .clone()
                        .unwrap_or_else(|| endpoints.auth_uri.clone()),
                    token_uri: client
                        .token_uri
                        .clone()
                        .unwrap_or_else(|| endpoints.token_uri.clone()),
                    client,
                    token_path: PathBuf::from(&settings.token_file),
                    refresh_token: None,
                    authorizer,
                }
            }
        };

        let cached = match &mut credentials {
            Credentials::Service { .. } => None,
            Credentials::User {
                token_path,
                refresh_token,
                ..
            } => {
                let contents = fs::read_to_string(&*token_path).ok();
                match token_state(contents.as_deref(), Utc::now()) {
                    TokenState::Valid(token) => {
                        debug!(path = %token_path.display(), "using cached user token");
                        *refresh_token = token.refresh_token.clone();
                        Some(AccessToken::from(&token))
                    }
                    TokenState::Stale {
                        refresh_token: stale_refresh,
                    } => {
                        *refresh_token = stale_refresh;
                        None
                    }
                }
            }
        };

        let token = match cached {
            Some(token) => token,
            None => acquire(&http, &mut credentials).await?,
        };

        Ok(Self {
            http,
            mode: settings.auth_mode,
            state: Mutex::new((credentials, Some(token))),
        })
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Current bearer token, refreshed first when it is about to expire.
    pub async fn access_token(&self) -> Result<String, SyncError> {
        let mut guard = self.state.lock().await;
        let (credentials, current) = &mut *guard;
        if let Some(token) = current.as_ref().filter(|t| t.is_fresh_at(Utc::now())) {
            return Ok(token.value.clone());
        }
        let token = acquire(&self.http, credentials).await?;
        let value = token.value.clone();
        *current = Some(token);
        Ok(value)
    }

    pub async fn current_expiry(&self) -> Option<DateTime<Utc>> {
        let guard = self.state.lock().await;
        guard.1.as_ref().and_then(|token| token.expires_at)
    }
}

async fn acquire(
    http: &reqwest::Client,
    credentials: &mut Credentials,
) -> Result<AccessToken, SyncError> {
    match credentials {
        Credentials::Service { key, token_uri } => service_token(http, key, token_uri).await,
        Credentials::User {
            client,
            auth_uri,
            token_uri,
            token_path,
            refresh_token,
            authorizer,
        } => {
            let user_token = match refresh_token.clone() {
                Some(refresh) => {
                    info!("refreshing expired user token");
                    refresh_user_token(http, client, token_uri, &refresh).await?
                }
                None => {
                    info!("no usable cached token; starting interactive authorization");
                    authorizer
                        .authorize(AuthorizationRequest {
                            client,
                            auth_uri,
                            token_uri,
                            scopes: GOOGLE_SCOPES,
                            http,
                        })
                        .await?
                }
            };
            save_user_token(token_path, &user_token)?;
            *refresh_token = user_token.refresh_token.clone();
            Ok(AccessToken::from(&user_token))
        }
    }
}

pub fn load_service_account(path: &Path) -> Result<ServiceAccountKey, SyncError> {
    let data = read_credential_file(path)?;
    serde_json::from_str(&data).map_err(|err| SyncError::InvalidCredentials {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

pub fn load_client_secret(path: &Path) -> Result<InstalledClient, SyncError> {
    let data = read_credential_file(path)?;
    let file: ClientSecretFile =
        serde_json::from_str(&data).map_err(|err| SyncError::InvalidCredentials {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    file.installed
        .or(file.web)
        .ok_or_else(|| SyncError::InvalidCredentials {
            path: path.to_path_buf(),
            reason: "missing \"installed\" or \"web\" client section".to_owned(),
        })
}

fn read_credential_file(path: &Path) -> Result<String, SyncError> {
    if path.as_os_str().is_empty() || !path.is_file() {
        return Err(SyncError::CredentialNotFound {
            path: path.to_path_buf(),
        });
    }
    fs::read_to_string(path).map_err(|source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes the token next to its final path and renames it into place so a
/// crash never leaves a half-written token file.
pub fn save_user_token(path: &Path, token: &UserToken) -> Result<(), SyncError> {
    let io_err = |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let payload = serde_json::to_string_pretty(token)
        .map_err(|err| SyncError::TokenRequestFailed(err.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload.as_bytes()).map_err(io_err)?;
    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    debug!(path = %path.display(), "user token saved");
    Ok(())
}

async fn service_token(
    http: &reqwest::Client,
    key: &ServiceAccountKey,
    token_uri: &str,
) -> Result<AccessToken, SyncError> {
    let now = Utc::now();
    let claims = JwtClaims {
        iss: &key.client_email,
        scope: GOOGLE_SCOPES.join(" "),
        aud: token_uri,
        iat: now.timestamp(),
        exp: now.timestamp() + JWT_LIFETIME_SECS,
    };
    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|err| {
        SyncError::InvalidCredentials {
            path: PathBuf::from(&key.client_email),
            reason: format!("private key: {err}"),
        }
    })?;
    let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
        .map_err(|err| SyncError::TokenRequestFailed(format!("jwt signing failed: {err}")))?;

    let response = post_token_form(
        http,
        token_uri,
        &[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)],
    )
    .await?;
    Ok(AccessToken {
        value: response.access_token,
        expires_at: response.expires_in.map(|secs| now + Duration::seconds(secs)),
    })
}

pub(crate) async fn refresh_user_token(
    http: &reqwest::Client,
    client: &InstalledClient,
    token_uri: &str,
    refresh_token: &str,
) -> Result<UserToken, SyncError> {
    let now = Utc::now();
    let response = post_token_form(
        http,
        token_uri,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &client.client_id),
            ("client_secret", &client.client_secret),
        ],
    )
    .await?;
    Ok(response.into_user_token(now, Some(refresh_token.to_owned())))
}

pub(crate) async fn post_token_form(
    http: &reqwest::Client,
    token_uri: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, SyncError> {
    let response = http
        .post(token_uri)
        .form(form)
        .send()
        .await
        .map_err(|err| SyncError::TokenRequestFailed(err.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(SyncError::TokenRequestFailed(format!(
            "status {status}: {text}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|err| SyncError::TokenRequestFailed(format!("bad token response: {err}")))
}
