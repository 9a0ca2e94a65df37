//! Error types for the Dispatcharr client and tick driver
//!
//! Three families are kept apart because the tick driver reacts to each
//! one differently:
//!
//! - [`AuthError`]: the backend refused our credentials (or the login call
//!   itself could not be made). A rejection is a persistent problem state.
//! - [`FetchError`]: a data endpoint failed. The tick is abandoned and the
//!   exposed entities are left as they were.
//! - [`TickError`]: what `run_tick` returns to its caller.
//!
//! A missing EPG program is not an error at all.

use thiserror::Error;

/// Authentication failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Credentials were rejected by the backend
    #[error("Dispatcharr rejected the credentials: {0}")]
    Rejected(String),

    /// The login exchange could not be completed (network, timeout, bad payload)
    #[error("Login request failed: {0}")]
    Transport(String),
}

impl AuthError {
    /// Maps the HTTP status of a failed login response
    pub fn from_status_code(code: u16, message: impl Into<String>) -> Self {
        match code {
            400 | 401 | 403 => Self::Rejected(message.into()),
            _ => Self::Transport(format!("HTTP {}: {}", code, message.into())),
        }
    }

    /// True when the backend explicitly refused the credentials
    pub fn is_rejection(&self) -> bool {
        matches!(self, AuthError::Rejected(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Transport(err.to_string())
    }
}

/// Data endpoint failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Transport level failure (connection, timeout, TLS)
    #[error("HTTP error: {0}")]
    Http(String),

    /// The backend answered with a non-success status
    #[error("Dispatcharr API error (code {code}): {message}")]
    Status { code: u16, message: String },

    /// The payload could not be decoded
    #[error("Unable to decode response: {0}")]
    Decode(String),

    /// The bearer token was refused; the caller should re-authenticate
    #[error("Token refused by Dispatcharr: {0}")]
    Unauthorized(String),
}

impl FetchError {
    /// Builds an error from a non-success HTTP status and its body
    pub fn from_status_code(code: u16, message: impl Into<String>) -> Self {
        match code {
            401 | 403 => Self::Unauthorized(message.into()),
            _ => Self::Status {
                code,
                message: message.into(),
            },
        }
    }

    /// True when the token must be renewed before retrying
    pub fn is_auth_error(&self) -> bool {
        matches!(self, FetchError::Unauthorized(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Decode(err.to_string())
    }
}

/// Why a tick produced no actions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TickError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Another tick is still running on this coordinator
    #[error("A previous tick is still running")]
    TickInProgress,
}

impl TickError {
    pub fn is_auth_error(&self) -> bool {
        match self {
            TickError::Auth(_) => true,
            TickError::Fetch(err) => err.is_auth_error(),
            TickError::TickInProgress => false,
        }
    }
}
