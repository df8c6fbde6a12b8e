//! Error types for credential storage operations

/// Errors from credential storage operations.
///
/// Payloads are rendered strings so the error stays `Clone`: a failed save can
/// be reported to every request waiting on the same refresh.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("storage parse error: {0}")]
    StorageParse(String),

    #[error("storage watch error: {0}")]
    Watch(String),
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;
