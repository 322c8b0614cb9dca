use reqwest::header;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, instrument};

use crate::config::Config;
use crate::error::Error;

/// Response shape of the v1 authentication endpoint. Everything except
/// `token` is only required when `token` is present; its absence is how the
/// service signals a rejected login.
#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: Option<String>,
    #[serde(rename = "tokenExpiration")]
    token_expiration: Option<u64>,
    #[serde(rename = "tokenPayload")]
    token_payload: Option<TokenPayload>,
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    user: Option<TokenUser>,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    user_id: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    secret: Option<String>,
    token: Option<String>,
    token_expiry: Option<Instant>,
    user_id: Option<String>,
}

/// Owns the auth token, its expiry, and the login protocol.
///
/// The token/expiry pair is the only mutable state shared across calls, so it
/// sits behind a mutex; a successful login replaces token, expiry, and user
/// id under a single lock acquisition.
pub(crate) struct SessionManager {
    http: reqwest::Client,
    auth_endpoint: String,
    user_agent: String,
    timeout: Duration,
    username: String,
    state: Mutex<State>,
}

impl SessionManager {
    pub fn new(http: reqwest::Client, config: &Config, username: impl Into<String>) -> Self {
        Self {
            http,
            auth_endpoint: config.auth_endpoint.to_string(),
            user_agent: config.user_agent.clone(),
            timeout: config.request.timeout,
            username: username.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Authenticate with the given secret.
    ///
    /// A response without a `token` field is a soft failure: it is logged,
    /// the previous session state is left untouched, and no error is
    /// returned. Transport failures and undecodable bodies are hard errors.
    #[instrument(skip_all, fields(username = %self.username))]
    pub async fn login(&self, secret: &str) -> Result<(), Error> {
        debug!("authenticating via {}", self.auth_endpoint);
        let response = self
            .http
            .post(&self.auth_endpoint)
            .timeout(self.timeout)
            .header(header::USER_AGENT, &self.user_agent)
            .header(header::CONTENT_TYPE, "application/json;charset=UTF-8")
            .header(header::ACCEPT, "application/json")
            .json(&json!({ "username": self.username, "password": secret }))
            .send()
            .await?;

        let body = response.text().await?;
        let auth: AuthResponse = serde_json::from_str(&body)?;

        let mut state = self.state.lock().await;
        self.absorb(&mut state, auth, Instant::now())
    }

    /// Apply an auth response to the session state. Token, expiry, and user
    /// id change together or not at all.
    fn absorb(&self, state: &mut State, auth: AuthResponse, now: Instant) -> Result<(), Error> {
        let Some(token) = auth.token else {
            error!("authentication failed for {}", self.username);
            return Ok(());
        };

        let ttl = auth
            .token_expiration
            .ok_or(Error::MissingField("tokenExpiration"))?;
        let user_id = auth
            .token_payload
            .and_then(|payload| payload.user)
            .and_then(|user| user.user_id)
            .ok_or(Error::MissingField("tokenPayload.user.user_id"))?;

        // Refresh at the midpoint of the token lifetime rather than at the
        // actual expiry; a near-dead token is as good as no token.
        state.token = Some(token);
        state.token_expiry = Some(now + Duration::from_secs(ttl / 2));
        state.user_id = Some(user_id);
        debug!("authenticated, token valid for {ttl}s");
        Ok(())
    }

    /// Opt in to credential retention so [`relogin`](Self::relogin) can run
    /// without the caller re-supplying the secret. Off by default.
    pub async fn save_secret(&self, secret: impl Into<String>) {
        self.state.lock().await.secret = Some(secret.into());
    }

    /// Re-authenticate with the retained secret, if the caller opted in to
    /// keeping one. A no-op otherwise.
    pub async fn relogin(&self) -> Result<(), Error> {
        let secret = self.state.lock().await.secret.clone();
        match secret {
            Some(secret) => self.login(&secret).await,
            None => {
                debug!("no retained secret, skipping re-login");
                Ok(())
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.is_connected_at(Instant::now()).await
    }

    async fn is_connected_at(&self, now: Instant) -> bool {
        let state = self.state.lock().await;
        state.token.is_some() && state.token_expiry.is_some_and(|expiry| now < expiry)
    }

    pub async fn auth_token(&self) -> Option<String> {
        self.state.lock().await.token.clone()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.state.lock().await.user_id.clone()
    }
}
