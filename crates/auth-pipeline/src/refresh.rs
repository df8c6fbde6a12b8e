//! Credential refresh
//!
//! Exchanges the stored refresh token for a new access token. The request
//! goes straight to the HTTP client, never through the pipeline, so a 401
//! from the refresh endpoint cannot recurse into another refresh.
//!
//! The coordinator performs one attempt per call. Making sure only one
//! attempt is outstanding at a time is the pipeline's job.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use token_store::credentials::normalize_entry;
use token_store::{CredentialPair, TokenStore};
use tracing::{debug, warn};

use crate::error::{AuthError, Error, Result};

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// Refresh endpoint response. `refresh` is only present when the server
/// rotates refresh tokens.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

pub struct RefreshCoordinator {
    client: reqwest::Client,
    refresh_url: String,
    store: Arc<TokenStore>,
}

impl RefreshCoordinator {
    pub fn new(client: reqwest::Client, refresh_url: String, store: Arc<TokenStore>) -> Self {
        Self {
            client,
            refresh_url,
            store,
        }
    }

    /// Obtain and store a new access token, returning it.
    ///
    /// A rejected refresh token surfaces as `AuthError::RefreshRejected`;
    /// clearing the store is left to the caller. If the new pair cannot be
    /// persisted the token is still returned and kept in memory.
    pub async fn refresh(&self) -> Result<String> {
        let Some(current) = self.store.credentials().await else {
            return Err(AuthError::NoRefreshToken.into());
        };

        debug!(url = %self.refresh_url, "requesting new access token");
        let response = self
            .client
            .post(&self.refresh_url)
            .json(&RefreshRequest {
                refresh: current.refresh(),
            })
            .send()
            .await
            .map_err(|e| Error::Network(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "refresh endpoint rejected refresh token");
            return Err(AuthError::RefreshRejected {
                status: status.as_u16(),
            }
            .into());
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("invalid refresh response: {e}")))?;
        let access = normalize_entry(&body.access)
            .ok_or_else(|| Error::Parse("refresh response has an empty access token".into()))?
            .to_string();

        let rotated = body.refresh.as_deref().and_then(normalize_entry);
        let pair = match rotated {
            Some(refresh) => CredentialPair::new(access.clone(), refresh),
            None => current.with_access(access.clone()),
        };
        debug!(rotated = rotated.is_some(), "refresh succeeded");

        if let Err(e) = self.store.save(pair).await {
            warn!(error = %e, "refreshed credentials could not be persisted, keeping them in memory");
        }
        Ok(access)
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refresh_url", &self.refresh_url)
            .finish_non_exhaustive()
    }
}
