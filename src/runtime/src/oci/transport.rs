//! Authenticated registry transport.
//!
//! A [`Transport`] is bound to one registry and one scope set. It pings
//! `/v2/`, answers the registry's challenge (a bearer token from the named
//! realm, or Basic credentials), and then attaches the resulting
//! `Authorization` header to every request until it is dropped.
//!
//! Network failures and 5xx responses are retried with backoff according to
//! the configured [`RetryPolicy`]. A 401 mid-session triggers exactly one
//! re-handshake and replay.

use std::sync::Arc;

use a3s_rebase_core::config::{RetryPolicy, TransportOptions};
use a3s_rebase_core::error::OciError;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use super::credentials::{Keychain, RegistryAuth};
use super::reference::Repository;

/// Client id sent with OAuth2 refresh-token grants.
const OAUTH_CLIENT_ID: &str = "a3s-rebase";

/// Failure of a single exchange, before the caller adds context.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection, timeout or body read error that outlived its retries
    #[error("{0}")]
    Network(String),

    /// The registry answered with a status the exchange cannot use
    #[error("registry returned {status}: {reason}")]
    Status { status: u16, reason: String },

    /// The handshake itself failed; already carries its final kind
    #[error(transparent)]
    Auth(#[from] OciError),
}

impl TransportError {
    /// Convert to an [`OciError`], wrapping network and status failures
    /// with `context`.
    pub fn into_oci(self, context: impl FnOnce(String) -> OciError) -> OciError {
        match self {
            TransportError::Auth(err) => err,
            other => context(other.to_string()),
        }
    }

    /// HTTP status behind the failure, if the registry answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Where a session is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    ChallengeReceived,
    TokenRequested,
    Authorized,
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl Challenge {
    /// Parse a challenge header. Unknown schemes yield `None`.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in parse_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }
        Some(Challenge::Bearer {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Split `k1="v1",k2=v2` into pairs. Commas inside quotes belong to the value.
fn parse_params(params: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();
        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim().to_string(), &after[end..]),
                None => (after.trim().to_string(), ""),
            }
        };
        pairs.push((key, value));
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }
    pairs
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Authenticated HTTP session against one registry for a fixed scope set.
pub struct Transport {
    http: reqwest::Client,
    registry: String,
    api_base: String,
    keychain: Arc<dyn Keychain>,
    scopes: Vec<String>,
    retry: RetryPolicy,
    authorization: RwLock<Option<String>>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("registry", &self.registry)
            .field("scopes", &self.scopes)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Transport {
    /// Open a session: ping the registry and complete its handshake.
    ///
    /// Rejected credentials and tokens come back as `Auth`; an unreachable
    /// registry or an unusable `/v2/` status is left for the caller to name.
    pub async fn connect(
        repository: &Repository,
        keychain: Arc<dyn Keychain>,
        scopes: Vec<String>,
        http: reqwest::Client,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        let transport = Self {
            http,
            registry: repository.registry().to_string(),
            api_base: repository.api_base(),
            keychain,
            scopes,
            retry: options.retry.clone(),
            authorization: RwLock::new(None),
            state: Mutex::new(SessionState::Unauthenticated),
        };

        let ping_url = format!("{}/", transport.api_base);
        let response = transport
            .execute(|client| client.get(ping_url.as_str()))
            .await
            .map_err(|e| match e {
                TransportError::Network(reason) => TransportError::Network(format!(
                    "cannot reach registry {}: {}",
                    transport.registry, reason
                )),
                other => other,
            })?;

        match response.status() {
            status if status.is_success() => {
                transport.set_state(SessionState::Authorized);
            }
            StatusCode::UNAUTHORIZED => {
                let challenge = challenge_of(&response);
                transport.authorize(challenge).await?;
            }
            StatusCode::FORBIDDEN => {
                return Err(OciError::PermissionDenied {
                    reference: repository.to_string(),
                    reason: format!("registry {} refused /v2/", transport.registry),
                }
                .into());
            }
            status => {
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    reason: format!("unexpected answer to {}", ping_url),
                });
            }
        }
        Ok(transport)
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// `<scheme>://<host>/v2`
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Send an authorized request built by `build`.
    ///
    /// `build` may be called more than once (retries, replay after a
    /// re-handshake), so it must produce an equivalent request each time.
    pub async fn send<F>(&self, build: F) -> Result<Response, TransportError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut refreshed = false;
        loop {
            let header = self.authorization.read().clone();
            let response = self
                .execute(|client| {
                    let request = build(client);
                    match header {
                        Some(ref value) => request.header(AUTHORIZATION, value.as_str()),
                        None => request,
                    }
                })
                .await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            if refreshed {
                return Err(OciError::AuthenticationFailed {
                    registry: self.registry.clone(),
                    reason: "request unauthorized after token refresh".to_string(),
                }
                .into());
            }
            tracing::debug!(registry = %self.registry, "Authorization rejected, renewing");
            refreshed = true;
            self.set_state(SessionState::ChallengeReceived);
            let challenge = challenge_of(&response);
            self.authorize(challenge).await?;
        }
    }

    /// Send once per attempt, retrying network failures and 5xx responses.
    /// The last 5xx response is returned as-is once attempts run out.
    async fn execute<F>(&self, build: F) -> Result<Response, TransportError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build(&self.http).send().await {
                Ok(response) if response.status().is_server_error() && attempt < max_attempts => {
                    tracing::debug!(
                        status = response.status().as_u16(),
                        attempt,
                        "Server error, retrying"
                    );
                }
                Ok(response) => return Ok(response),
                Err(e) if attempt < max_attempts => {
                    tracing::debug!(error = %e, attempt, "Request failed, retrying");
                }
                Err(e) => return Err(TransportError::Network(e.to_string())),
            }
            tokio::time::sleep(self.retry.backoff(attempt)).await;
        }
    }

    /// Answer a challenge and store the resulting authorization header.
    async fn authorize(&self, challenge: Option<Challenge>) -> Result<(), OciError> {
        self.set_state(SessionState::ChallengeReceived);
        let auth = self
            .keychain
            .resolve(&self.registry)
            .map_err(|e| self.auth_failed(format!("cannot resolve credentials: {}", e)))?;

        let header = match challenge {
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                self.set_state(SessionState::TokenRequested);
                let token = self
                    .request_token(&auth, &realm, service.as_deref(), scope.as_deref())
                    .await?;
                format!("Bearer {}", token)
            }
            Some(Challenge::Basic) => match auth {
                RegistryAuth::Basic {
                    ref username,
                    ref password,
                } => {
                    let encoded = base64::engine::general_purpose::STANDARD
                        .encode(format!("{}:{}", username, password));
                    format!("Basic {}", encoded)
                }
                _ => {
                    return Err(self.auth_failed(
                        "registry requires basic credentials but none were found".to_string(),
                    ))
                }
            },
            None => {
                return Err(self.auth_failed("401 without a usable challenge".to_string()));
            }
        };

        *self.authorization.write() = Some(header);
        self.set_state(SessionState::Authorized);
        Ok(())
    }

    async fn request_token(
        &self,
        auth: &RegistryAuth,
        realm: &str,
        service: Option<&str>,
        challenge_scope: Option<&str>,
    ) -> Result<String, OciError> {
        let mut scopes = self.scopes.clone();
        if let Some(extra) = challenge_scope {
            for s in extra.split(' ').filter(|s| !s.is_empty()) {
                if !scopes.iter().any(|known| known == s) {
                    scopes.push(s.to_string());
                }
            }
        }

        let response = match auth {
            RegistryAuth::Bearer(identity_token) => {
                let mut form = vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", identity_token.clone()),
                    ("client_id", OAUTH_CLIENT_ID.to_string()),
                    ("scope", scopes.join(" ")),
                ];
                if let Some(service) = service {
                    form.push(("service", service.to_string()));
                }
                self.execute(|client| client.post(realm).form(&form)).await
            }
            _ => {
                let mut query: Vec<(&str, &str)> = Vec::new();
                if let Some(service) = service {
                    query.push(("service", service));
                }
                for scope in &scopes {
                    query.push(("scope", scope.as_str()));
                }
                self.execute(|client| {
                    let request = client.get(realm).query(&query);
                    match auth {
                        RegistryAuth::Basic { username, password } => {
                            request.basic_auth(username, Some(password))
                        }
                        _ => request,
                    }
                })
                .await
            }
        }
        .map_err(|e| self.auth_failed(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.auth_failed(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.auth_failed(format!("invalid token response: {}", e)))?;
        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.auth_failed("token response carried no token".to_string()))?;

        tracing::debug!(registry = %self.registry, scopes = ?scopes, "Obtained bearer token");
        Ok(token)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn auth_failed(&self, reason: String) -> OciError {
        OciError::AuthenticationFailed {
            registry: self.registry.clone(),
            reason,
        }
    }
}

fn challenge_of(response: &Response) -> Option<Challenge> {
    response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .and_then(Challenge::parse)
}
