//! Shared authentication context
//!
//! `AuthContext` is built once per process and handed (as `Arc`) to every
//! API facade. It owns the token store, the event bus and the pipeline, so
//! all facades see the same credentials and share one refresh.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use token_store::{AuthEventBus, SyncMode, TokenStorage, TokenStore, spawn_sync_task};
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::options::RequestOptions;
use crate::pipeline::{AuthState, RequestPipeline};
use crate::session;

/// Upper bound for any single HTTP exchange, refreshes included.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AuthContext {
    storage: Arc<dyn TokenStorage>,
    pipeline: RequestPipeline,
}

impl AuthContext {
    /// Load stored credentials and build the HTTP client.
    pub async fn new(config: PipelineConfig, storage: Arc<dyn TokenStorage>) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, config, storage).await)
    }

    /// Like [`AuthContext::new`] with a caller-supplied client.
    pub async fn with_client(
        client: reqwest::Client,
        config: PipelineConfig,
        storage: Arc<dyn TokenStorage>,
    ) -> Arc<Self> {
        let events = Arc::new(AuthEventBus::new());
        let store =
            Arc::new(TokenStore::load(storage.clone(), events, config.safety_margin()).await);
        info!(base_url = %config.base_url, "auth context ready");
        Arc::new(Self {
            storage,
            pipeline: RequestPipeline::new(client, config, store),
        })
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        self.pipeline.store()
    }

    pub fn events(&self) -> &Arc<AuthEventBus> {
        self.pipeline.events()
    }

    pub fn config(&self) -> &PipelineConfig {
        self.pipeline.config()
    }

    pub async fn request(&self, endpoint: &str, options: RequestOptions) -> Result<Value> {
        self.pipeline.request(endpoint, options).await
    }

    pub async fn auth_state(&self) -> AuthState {
        self.pipeline.auth_state().await
    }

    /// Keep this context in step with other processes sharing the storage.
    pub fn spawn_sync(&self, poll_interval: Duration) -> (SyncMode, tokio::task::JoinHandle<()>) {
        spawn_sync_task(self.store().clone(), self.storage.clone(), poll_interval)
    }

    /// Exchange a username and password for a session. Returns the user profile.
    pub async fn login(&self, username: &str, password: &str) -> Result<Value> {
        let endpoint = self.config().login_path.clone();
        session::authenticate(
            &self.pipeline,
            &endpoint,
            json!({ "username": username, "password": password }),
        )
        .await
    }

    /// Create an account and sign in with it. Returns the user profile.
    pub async fn register(&self, payload: Value) -> Result<Value> {
        let endpoint = self.config().register_path.clone();
        session::authenticate(&self.pipeline, &endpoint, payload).await
    }

    /// End the session.
    ///
    /// When a logout endpoint is configured the refresh token is revoked
    /// server-side first; that call's outcome is ignored. Local credentials
    /// are always cleared.
    pub async fn logout(&self) -> Result<()> {
        if let (Some(path), Some(refresh)) = (
            self.config().logout_path.as_deref(),
            self.store().refresh_token().await,
        ) {
            self.pipeline
                .request_best_effort(
                    path,
                    RequestOptions::post(json!({ "refresh": refresh })).without_refresh(),
                )
                .await;
        }
        self.store().clear().await?;
        Ok(())
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("storage", &self.storage.describe())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
