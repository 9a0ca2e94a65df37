//! Bearer token management
//!
//! [`AuthSession`] keeps the last access token with its (known or assumed)
//! expiry and logs in again only when needed. Login exchanges are
//! serialized: callers that queued behind a running exchange reuse its
//! outcome, error included, instead of hammering the backend with the same
//! credentials.

use crate::error::AuthError;
use crate::models::{LoginResponse, Token};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Assumed token lifetime when the backend does not announce one
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 25 * 60;

/// Tokens are renewed this long before their expiry
const EXPIRY_MARGIN_SECS: i64 = 30;

/// Upper bound applied to announced and configured lifetimes (one day)
pub const MAX_TOKEN_LIFETIME_SECS: u64 = 24 * 60 * 60;

fn lifetime(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_TOKEN_LIFETIME_SECS) as i64)
}

/// Performs the login exchange; implemented by the HTTP layer
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError>;
}

/// Username/password pair
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: Token,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS)
    }
}

#[derive(Debug, Default)]
struct TokenState {
    cached: Option<CachedToken>,
    /// Outcome of the latest exchange, when it failed
    last_failure: Option<AuthError>,
}

/// Token cache with single-flight login
pub struct AuthSession {
    authenticator: Arc<dyn Authenticator>,
    credentials: Credentials,
    assumed_lifetime: Duration,
    state: Mutex<TokenState>,
    /// Bumped after every completed login exchange
    generation: AtomicU64,
}

impl AuthSession {
    pub fn new(authenticator: Arc<dyn Authenticator>, credentials: Credentials) -> Self {
        Self {
            authenticator,
            credentials,
            assumed_lifetime: lifetime(DEFAULT_TOKEN_LIFETIME_SECS),
            state: Mutex::new(TokenState::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Lifetime used when the login response has no `expires_in`
    pub fn with_assumed_lifetime(mut self, secs: u64) -> Self {
        self.assumed_lifetime = lifetime(secs);
        self
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    /// Number of login exchanges completed so far
    pub fn login_count(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns a token that is presumed valid, logging in if needed
    ///
    /// # Errors
    ///
    /// * `AuthError::Rejected` - the backend refused the credentials
    /// * `AuthError::Transport` - the login call itself failed
    pub async fn get_valid_token(&self) -> Result<Token, AuthError> {
        self.get_valid_token_at(Utc::now()).await
    }

    pub(crate) async fn get_valid_token_at(&self, now: DateTime<Utc>) -> Result<Token, AuthError> {
        let seen = self.generation.load(Ordering::Acquire);
        let mut state = self.state.lock().await;

        if let Some(cached) = state.cached.as_ref().filter(|c| c.is_valid_at(now)) {
            return Ok(cached.token.clone());
        }

        if self.generation.load(Ordering::Acquire) != seen {
            if let Some(err) = &state.last_failure {
                debug!("Reusing the outcome of the login that completed while waiting");
                return Err(err.clone());
            }
        }

        let outcome = self.exchange(now).await;
        match &outcome {
            Ok(cached) => {
                state.cached = Some(cached.clone());
                state.last_failure = None;
            }
            Err(err) => {
                state.cached = None;
                state.last_failure = Some(err.clone());
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);

        outcome.map(|cached| cached.token)
    }

    /// Drops the cached token; the next call logs in again
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if state.cached.take().is_some() {
            debug!("Cached Dispatcharr token invalidated");
        }
    }

    async fn exchange(&self, now: DateTime<Utc>) -> Result<CachedToken, AuthError> {
        info!("Logging in to Dispatcharr as {}", self.credentials.username);

        let response = self
            .authenticator
            .login(&self.credentials.username, &self.credentials.password)
            .await
            .inspect_err(|err| warn!("Dispatcharr login failed: {}", err))?;

        let access = response
            .access
            .filter(|a| !a.is_empty())
            .ok_or_else(|| AuthError::Rejected("login response carried no access token".into()))?;

        let valid_for = response
            .expires_in
            .map(lifetime)
            .unwrap_or(self.assumed_lifetime);

        debug!("Login successful, token valid for {}s", valid_for.num_seconds());

        Ok(CachedToken {
            token: Token::new(access),
            expires_at: now
                .checked_add_signed(valid_for)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        })
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("credentials", &self.credentials)
            .field("assumed_lifetime", &self.assumed_lifetime)
            .field("logins", &self.login_count())
            .finish()
    }
}
