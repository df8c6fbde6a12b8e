//! Error types for pipeline calls
//!
//! `Error` is `Clone` because one refresh outcome is handed to every call
//! that was waiting on it.

use serde_json::Value;

/// Credential refresh failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("refresh token rejected by server (HTTP {status})")]
    RefreshRejected { status: u16 },
}

/// Errors surfaced to callers of the pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No response was received.
    #[error("network error: {0}")]
    Network(String),

    /// A response arrived with a failure status. `body` is the parsed JSON
    /// body when the server sent one.
    #[error("HTTP {status}{}", body_suffix(.body))]
    Http { status: u16, body: Option<Value> },

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A response body could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("credential storage error: {0}")]
    Storage(#[from] token_store::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::Auth(AuthError::RefreshRejected { status }) => Some(*status),
            _ => None,
        }
    }

    /// Parsed response body for `Http` errors.
    pub fn body(&self) -> Option<&Value> {
        match self {
            Error::Http { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}

fn body_suffix(body: &Option<Value>) -> String {
    match body {
        Some(body) => format!(": {body}"),
        None => String::new(),
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
