//! Process-wide credential holder
//!
//! `TokenStore` is the only writer of the credential pair. One instance is
//! shared (via `Arc`) by every client in the process; a second instance over
//! the same storage is a separate context that converges through `reload`.
//!
//! The state lock is held across the durable write in `save`/`clear`, so a
//! concurrent `reload` either sees the old entries or the new ones, never an
//! in-memory pair that storage has not caught up with yet.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::credentials::CredentialPair;
use crate::error::Result;
use crate::events::{AuthEventBus, AuthEventKind};
use crate::storage::{StorageEntries, TokenStorage};
use crate::token;

pub struct TokenStore {
    storage: Arc<dyn TokenStorage>,
    state: RwLock<Option<CredentialPair>>,
    events: Arc<AuthEventBus>,
    safety_margin: Duration,
}

impl TokenStore {
    /// Load the current pair from storage.
    ///
    /// Unreadable or partial entries load as "no credentials" rather than an
    /// error, so a damaged token file sends the user back to login instead of
    /// preventing startup.
    pub async fn load(
        storage: Arc<dyn TokenStorage>,
        events: Arc<AuthEventBus>,
        safety_margin: Duration,
    ) -> Self {
        let pair = match storage.load().await {
            Ok(entries) => CredentialPair::from_entries(&entries),
            Err(e) => {
                warn!(storage = %storage.describe(), error = %e, "failed to load stored credentials, starting unauthenticated");
                None
            }
        };
        info!(
            storage = %storage.describe(),
            authenticated = pair.is_some(),
            "token store loaded"
        );
        Self {
            storage,
            state: RwLock::new(pair),
            events,
            safety_margin,
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|p| p.access().to_string())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|p| p.refresh().to_string())
    }

    pub async fn credentials(&self) -> Option<CredentialPair> {
        self.state.read().await.clone()
    }

    /// The access token, if one is stored and not expired.
    pub async fn valid_access_token(&self) -> Option<String> {
        self.access_token()
            .await
            .filter(|access| !self.is_expired(access))
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Expiry check using this store's safety margin.
    pub fn is_expired(&self, token: &str) -> bool {
        token::is_expired(token, self.safety_margin)
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    pub fn events(&self) -> &Arc<AuthEventBus> {
        &self.events
    }

    /// Replace the pair, persist it, and emit `token_refresh`.
    ///
    /// Memory is updated before the durable write; a failed write is returned
    /// to the caller but the in-memory pair stays current for this process.
    pub async fn save(&self, pair: CredentialPair) -> Result<()> {
        let persisted = {
            let mut state = self.state.write().await;
            let entries = pair.to_entries();
            *state = Some(pair);
            self.storage.persist(entries).await
        };
        debug!("credentials saved");
        self.events
            .publish(AuthEventKind::TokenRefresh, serde_json::Value::Null);
        persisted
    }

    /// Drop the pair from memory and storage.
    ///
    /// Emits `logout` only when a pair was held, so clearing an already empty
    /// store is silent.
    pub async fn clear(&self) -> Result<()> {
        let state = self.state.write().await;
        self.clear_locked(state).await
    }

    /// Clear only if the held pair is still `expected`.
    ///
    /// Returns `Ok(false)` and leaves everything untouched when another
    /// writer (a login, a sync) replaced the pair in the meantime.
    pub async fn clear_if_unchanged(&self, expected: Option<&CredentialPair>) -> Result<bool> {
        let state = self.state.write().await;
        if state.as_ref() != expected {
            debug!("credentials replaced since they were read, not clearing");
            return Ok(false);
        }
        self.clear_locked(state).await.map(|()| true)
    }

    async fn clear_locked(
        &self,
        mut state: RwLockWriteGuard<'_, Option<CredentialPair>>,
    ) -> Result<()> {
        let had_pair = state.take().is_some();
        let persisted = self.storage.persist(StorageEntries::new()).await;
        drop(state);

        if had_pair {
            info!("credentials cleared");
            self.events
                .publish(AuthEventKind::Logout, serde_json::Value::Null);
        }
        persisted
    }

    /// Re-read storage after another context may have written it.
    ///
    /// Emits `token_refresh` when a different pair appeared and `logout` when
    /// the pair disappeared. Returns whether the in-memory pair changed.
    pub async fn reload(&self) -> Result<bool> {
        let (changed, now_present) = {
            let mut state = self.state.write().await;
            let entries = self.storage.load().await?;
            let loaded = CredentialPair::from_entries(&entries);
            if *state == loaded {
                return Ok(false);
            }
            let now_present = loaded.is_some();
            *state = loaded;
            (true, now_present)
        };

        info!(authenticated = now_present, "credentials changed in storage, reloaded");
        let kind = if now_present {
            AuthEventKind::TokenRefresh
        } else {
            AuthEventKind::Logout
        };
        self.events.publish(kind, serde_json::Value::Null);
        Ok(changed)
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("storage", &self.storage.describe())
            .field("safety_margin", &self.safety_margin)
            .finish_non_exhaustive()
    }
}
