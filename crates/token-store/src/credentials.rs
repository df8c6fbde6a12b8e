//! The credential pair and its durable key layout
//!
//! Durable storage holds two independent string entries, one per token.
//! Other writers sharing the same storage (older clients, scripts) have been
//! seen to leave serialized placeholders such as `"null"` behind, so every
//! entry goes through [`normalize_entry`] before it is trusted.

use common::Secret;

use crate::storage::StorageEntries;

/// Storage key for the access token entry.
pub const ACCESS_KEY: &str = "access_token";

/// Storage key for the refresh token entry.
pub const REFRESH_KEY: &str = "refresh_token";

/// Literal values that mean "no token" when found in storage.
const ABSENT_PLACEHOLDERS: &[&str] = &["null", "undefined", "none"];

/// The process's current access/refresh credentials.
///
/// `access` is short-lived and carries an `exp` claim; `refresh` is exchanged
/// for a new access token and is reused until the server rejects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    access: Secret<String>,
    refresh: Secret<String>,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: Secret::new(refresh.into()),
        }
    }

    pub fn access(&self) -> &str {
        self.access.expose_str()
    }

    pub fn refresh(&self) -> &str {
        self.refresh.expose_str()
    }

    /// Same refresh token, new access token.
    pub fn with_access(&self, access: impl Into<String>) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: self.refresh.clone(),
        }
    }

    /// Rebuild a pair from raw storage entries.
    ///
    /// Returns `None` unless both entries hold a real token.
    pub fn from_entries(entries: &StorageEntries) -> Option<Self> {
        let access = entries.get(ACCESS_KEY).and_then(|v| normalize_entry(v))?;
        let refresh = entries.get(REFRESH_KEY).and_then(|v| normalize_entry(v))?;
        Some(Self::new(access, refresh))
    }

    /// Storage entries for this pair.
    pub fn to_entries(&self) -> StorageEntries {
        let mut entries = StorageEntries::new();
        entries.insert(ACCESS_KEY.to_string(), self.access().to_string());
        entries.insert(REFRESH_KEY.to_string(), self.refresh().to_string());
        entries
    }
}

/// Trim a stored value and drop it if it is empty or an absent placeholder.
pub fn normalize_entry(raw: &str) -> Option<&str> {
    let value = raw.trim();
    if value.is_empty()
        || ABSENT_PLACEHOLDERS
            .iter()
            .any(|p| p.eq_ignore_ascii_case(value))
    {
        return None;
    }
    Some(value)
}
