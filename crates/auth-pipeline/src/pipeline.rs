//! Authenticated request pipeline
//!
//! Every API call goes through [`RequestPipeline::request`]:
//!
//! 1. Attach `Authorization: Bearer <access>` when the stored access token
//!    is present and not expired. An expired token is simply not sent; the
//!    server's 401 drives the refresh.
//! 2. On a 401 for a call that may refresh, join the single refresh in
//!    flight (starting it if none is running), then replay the call once
//!    with the new token.
//! 3. Anything else, including a 401 on a replay, goes back to the caller.
//!
//! Refresh state lives behind one `std::sync::Mutex` shared by all clones.
//! The lock is never held across an `.await`: callers enqueue a oneshot and
//! wait on it outside the lock, and the refresh task settles the whole queue
//! in one critical section before clearing the `refreshing` flag.
//!
//! Each settled refresh bumps a generation counter. A call whose 401 arrives
//! after a refresh that started later than the call itself failed gets that
//! refresh's error instead of starting another one.
//!
//! Credentials only ever go to the `base_url` origin; absolute endpoints on
//! any other origin are sent anonymously and never refresh.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use token_store::{AuthEventBus, AuthEventKind, TokenStore};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::options::RequestOptions;
use crate::refresh::RefreshCoordinator;
use crate::response::{RawResponse, ResponseClass};

/// Authentication state as seen by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    /// A refresh is in flight; 401s are queued behind it.
    Refreshing,
}

/// A call waiting for the in-flight refresh.
struct PendingCall {
    call_id: Uuid,
    settle: oneshot::Sender<Result<String>>,
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    queue: VecDeque<PendingCall>,
    /// Number of refreshes settled so far.
    generation: u64,
    /// Error of the most recent refresh, if it failed.
    last_failure: Option<Error>,
}

struct Inner {
    client: reqwest::Client,
    config: PipelineConfig,
    store: Arc<TokenStore>,
    coordinator: RefreshCoordinator,
    refresh: Mutex<RefreshState>,
}

impl Inner {
    fn lock_refresh(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `outcome` to every waiter, then reopen for the next refresh.
    fn settle(&self, outcome: Result<String>) {
        let mut state = self.lock_refresh();
        let waiters = state.queue.len();
        while let Some(pending) = state.queue.pop_front() {
            if pending.settle.send(outcome.clone()).is_err() {
                debug!(call_id = %pending.call_id, "waiter went away before refresh settled");
            }
        }
        state.refreshing = false;
        state.generation += 1;
        state.last_failure = outcome.as_ref().err().cloned();
        debug!(
            waiters,
            generation = state.generation,
            success = outcome.is_ok(),
            "refresh settled"
        );
    }
}

/// Cheap to clone; all clones share the store and the refresh state.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<Inner>,
}

impl RequestPipeline {
    pub fn new(client: reqwest::Client, config: PipelineConfig, store: Arc<TokenStore>) -> Self {
        let coordinator = RefreshCoordinator::new(client.clone(), config.refresh_url(), store.clone());
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                store,
                coordinator,
                refresh: Mutex::new(RefreshState::default()),
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.inner.store
    }

    pub fn events(&self) -> &Arc<AuthEventBus> {
        self.inner.store.events()
    }

    /// Issue a call and return its decoded payload.
    pub async fn request(&self, endpoint: &str, options: RequestOptions) -> Result<Value> {
        let call_id = Uuid::new_v4();
        let span = info_span!(
            "api_call",
            %call_id,
            method = %options.method(),
            endpoint,
        );
        self.execute(call_id, endpoint, options).instrument(span).await
    }

    /// Issue a call and deserialize its payload into `T`.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T> {
        let value = self.request(endpoint, options).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Parse(format!("unexpected response shape from {endpoint}: {e}")))
    }

    /// Issue a call whose failure does not matter to the caller.
    pub async fn request_best_effort(&self, endpoint: &str, options: RequestOptions) -> Option<Value> {
        match self.request(endpoint, options).await {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(endpoint, error = %e, "best-effort call failed, ignoring");
                None
            }
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_refresh().refreshing
    }

    pub async fn auth_state(&self) -> AuthState {
        if self.is_refreshing() {
            AuthState::Refreshing
        } else if self.inner.store.is_authenticated().await {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    async fn execute(&self, call_id: Uuid, endpoint: &str, options: RequestOptions) -> Result<Value> {
        let url = self.inner.config.url(endpoint);
        let api_origin = self.inner.config.is_api_origin(&url);
        if options.sends_credentials() && !api_origin {
            debug!(%url, "endpoint outside the API origin, sending without credentials");
        }

        let dispatched = self.inner.lock_refresh().generation;
        let sent_with = if options.sends_credentials() && api_origin {
            self.inner.store.valid_access_token().await
        } else {
            None
        };

        let response = self.send(&url, &options, sent_with.as_deref()).await?;
        if response.class() != ResponseClass::AuthFailure || !options.may_refresh() || !api_origin {
            return response.into_payload();
        }

        // A refresh may have finished while this call was in flight. In that
        // case the store already holds a newer token than the one rejected.
        let token = match self.inner.store.valid_access_token().await {
            Some(current) if sent_with.as_deref() != Some(current.as_str()) => {
                debug!("credential replaced while call was in flight, replaying without refresh");
                current
            }
            _ => self.await_refresh(call_id, dispatched).await?,
        };

        metrics::record_replay();
        let replay = options.into_replay();
        let response = self.send(&url, &replay, Some(&token)).await?;
        if response.class() == ResponseClass::AuthFailure {
            warn!("replayed call rejected with a fresh credential");
        }
        response.into_payload()
    }

    /// Join the in-flight refresh, starting one if none is running.
    ///
    /// `dispatched` is the refresh generation when the call was sent. If a
    /// refresh settled since then and failed, the call shares its error.
    async fn await_refresh(&self, call_id: Uuid, dispatched: u64) -> Result<String> {
        let (settle, outcome) = oneshot::channel();
        let start = {
            let mut state = self.inner.lock_refresh();
            if !state.refreshing && state.generation != dispatched {
                if let Some(error) = &state.last_failure {
                    debug!(error = %error, "refresh already failed since dispatch");
                    return Err(error.clone());
                }
            }
            state.queue.push_back(PendingCall { call_id, settle });
            !std::mem::replace(&mut state.refreshing, true)
        };

        if start {
            info!("credential rejected, refreshing");
            let inner = self.inner.clone();
            tokio::spawn(run_refresh(inner).instrument(info_span!("credential_refresh")));
        } else {
            metrics::record_queued();
            debug!("refresh already in flight, queued");
        }

        outcome
            .await
            .map_err(|_| Error::Internal("refresh task ended without settling".into()))?
    }

    async fn send(
        &self,
        url: &str,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<RawResponse> {
        let mut headers = options.headers().clone();
        headers.remove(AUTHORIZATION);

        let mut builder = self
            .inner
            .client
            .request(options.method().clone(), url)
            .headers(headers);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = options.body() {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Network(format!("request to {url} failed: {e}")))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("failed to read response from {url}: {e}")))?
            .to_vec();

        metrics::record_request(status);
        debug!(
            status,
            credentialed = token.is_some(),
            retried = options.is_retried(),
            "call completed"
        );
        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Run one refresh to completion and settle every waiter with its outcome.
///
/// Runs on its own task so the waiters are settled even if the call that
/// started the refresh is dropped.
async fn run_refresh(inner: Arc<Inner>) {
    let started_from = inner.store.credentials().await;
    let outcome = match AssertUnwindSafe(inner.coordinator.refresh())
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::Internal("credential refresh panicked".into())),
    };

    match &outcome {
        Ok(_) => {
            metrics::record_refresh("success");
            info!("refresh succeeded, replaying queued calls");
        }
        Err(e) => {
            metrics::record_refresh("failure");
            let signed_out = match inner.store.clear_if_unchanged(started_from.as_ref()).await {
                Ok(cleared) => cleared,
                Err(clear_err) => {
                    warn!(error = %clear_err, "failed to clear stored credentials");
                    true
                }
            };
            if signed_out {
                warn!(error = %e, "refresh failed, signing out");
                inner
                    .store
                    .events()
                    .publish(AuthEventKind::Unauthorized, json!({ "reason": e.to_string() }));
            } else {
                info!(error = %e, "refresh failed, but newer credentials were saved meanwhile");
            }
        }
    }

    inner.settle(outcome);
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("base_url", &self.inner.config.base_url)
            .field("refreshing", &self.is_refreshing())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::mock::{MockApi, RefreshMode, expired_token, valid_token};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use token_store::{CredentialPair, DEFAULT_SAFETY_MARGIN, MemoryStorage};

    async fn pipeline(api: &MockApi, storage: &MemoryStorage) -> RequestPipeline {
        let store = Arc::new(
            TokenStore::load(
                Arc::new(storage.clone()),
                Arc::new(AuthEventBus::new()),
                DEFAULT_SAFETY_MARGIN,
            )
            .await,
        );
        RequestPipeline::new(reqwest::Client::new(), PipelineConfig::new(&api.url), store)
    }

    fn counter(events: &AuthEventBus, kind: AuthEventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        events.subscribe(kind, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    /// A store holding a well-formed, unexpired token the server no longer accepts.
    async fn revoked_session(api: &MockApi, storage: &MemoryStorage) -> RequestPipeline {
        let pipeline = pipeline(api, storage).await;
        pipeline
            .store()
            .save(CredentialPair::new(valid_token("A1"), "R1"))
            .await
            .unwrap();
        pipeline
    }

    #[tokio::test]
    async fn valid_token_is_attached() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;
        api.accept(&valid_token("A1"));

        let value = pipeline.request("/items/7", RequestOptions::get()).await.unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["token"], valid_token("A1"));
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn expired_token_is_not_sent_and_refresh_recovers() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&api, &storage).await;
        pipeline
            .store()
            .save(CredentialPair::new(expired_token("A1"), "R1"))
            .await
            .unwrap();

        let value = pipeline.request("/items/1", RequestOptions::get()).await.unwrap();

        assert_eq!(value["token"], api.issued_token(1));
        assert_eq!(api.refresh_calls(), 1);
        // First attempt without credentials, then the replay.
        assert_eq!(api.item_calls(), 2);
        assert_eq!(pipeline.store().refresh_token().await.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn caller_authorization_header_is_replaced() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;
        api.accept(&valid_token("A1"));

        let options = RequestOptions::get().header(
            AUTHORIZATION,
            reqwest::header::HeaderValue::from_static("Bearer forged"),
        );
        let value = pipeline.request("/items/3", options).await.unwrap();
        assert_eq!(value["token"], valid_token("A1"));
    }

    #[tokio::test]
    async fn concurrent_401s_share_one_refresh() {
        let api = MockApi::start().await;
        api.set_refresh_delay(Duration::from_millis(200));
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;

        let calls = (1..=5u64).map(|id| {
            let pipeline = pipeline.clone();
            async move { pipeline.request(&format!("/items/{id}"), RequestOptions::get()).await }
        });
        let results = futures_util::future::join_all(calls).await;

        assert_eq!(api.refresh_calls(), 1);
        for (i, result) in results.into_iter().enumerate() {
            let value = result.unwrap();
            // Each caller gets its own replayed response.
            assert_eq!(value["id"], i as u64 + 1);
            assert_eq!(value["token"], api.issued_token(1));
        }
        assert!(!pipeline.is_refreshing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_flight_holds_across_threads() {
        let api = MockApi::start().await;
        api.set_refresh_delay(Duration::from_millis(200));
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;

        let handles: Vec<_> = (1..=8u64)
            .map(|id| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    pipeline.request(&format!("/items/{id}"), RequestOptions::get()).await
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value["id"], i as u64 + 1);
        }
        assert_eq!(api.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn refresh_failure_fans_out_to_every_waiter() {
        let api = MockApi::start().await;
        api.set_refresh_mode(RefreshMode::Reject(401));
        api.set_refresh_delay(Duration::from_millis(200));
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;
        let unauthorized = counter(pipeline.events(), AuthEventKind::Unauthorized);
        let logouts = counter(pipeline.events(), AuthEventKind::Logout);

        let calls = (1..=4u64).map(|id| {
            let pipeline = pipeline.clone();
            async move { pipeline.request(&format!("/items/{id}"), RequestOptions::get()).await }
        });
        let results = futures_util::future::join_all(calls).await;

        for result in results {
            assert!(matches!(
                result.unwrap_err(),
                Error::Auth(AuthError::RefreshRejected { status: 401 })
            ));
        }
        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(unauthorized.load(Ordering::SeqCst), 1);
        assert_eq!(logouts.load(Ordering::SeqCst), 1);
        assert!(storage.snapshot().is_empty());
        assert_eq!(pipeline.auth_state().await, AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn unauthorized_payload_carries_reason() {
        let api = MockApi::start().await;
        api.set_refresh_mode(RefreshMode::Reject(400));
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;

        let reasons = Arc::new(Mutex::new(Vec::new()));
        let seen = reasons.clone();
        pipeline
            .events()
            .subscribe(AuthEventKind::Unauthorized, move |event| {
                seen.lock().unwrap().push(event.payload.clone());
                Ok(())
            });

        let _ = pipeline.request("/items/1", RequestOptions::get()).await;
        let reasons = reasons.lock().unwrap();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0]["reason"].as_str().unwrap().contains("HTTP 400"));
    }

    #[tokio::test]
    async fn persistent_401_does_not_refresh_twice() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;

        let err = pipeline
            .request("/always-401", RequestOptions::get())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert!(matches!(err, Error::Http { status: 401, .. }));
        assert_eq!(api.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn no_refresh_token_rejects_without_network() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&api, &storage).await;
        let unauthorized = counter(pipeline.events(), AuthEventKind::Unauthorized);

        let err = pipeline
            .request("/items/1", RequestOptions::get())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Auth(AuthError::NoRefreshToken)));
        assert_eq!(api.refresh_calls(), 0);
        assert_eq!(unauthorized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn anonymous_calls_never_refresh() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;

        let err = pipeline
            .request("/items/1", RequestOptions::get().without_credentials())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));

        let value = pipeline
            .request("/public", RequestOptions::get().without_credentials())
            .await
            .unwrap();
        assert_eq!(value["had_credentials"], false);
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn without_refresh_surfaces_401() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;

        let err = pipeline
            .request("/items/1", RequestOptions::get().without_refresh())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn stale_credential_replays_without_refresh() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;

        // The slow call leaves with A1; the fast call gets its 401 and
        // refreshes to A2 before the slow call's 401 comes back.
        let slow = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.request("/slow/2", RequestOptions::get()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipeline.request("/items/1", RequestOptions::get()).await.unwrap();
        assert_eq!(api.refresh_calls(), 1);

        let value = slow.await.unwrap().unwrap();
        assert_eq!(value["id"], 2);
        assert_eq!(value["token"], api.issued_token(1));
        assert_eq!(api.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn late_401_shares_the_failed_refresh() {
        let api = MockApi::start().await;
        api.set_refresh_mode(RefreshMode::Reject(400));
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;
        let unauthorized = counter(pipeline.events(), AuthEventKind::Unauthorized);
        let logouts = counter(pipeline.events(), AuthEventKind::Logout);

        // The slow call leaves with A1; its 401 only comes back after the
        // fast call's refresh was rejected and the store cleared.
        let slow = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.request("/slow/2", RequestOptions::get()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast = pipeline
            .request("/items/1", RequestOptions::get())
            .await
            .unwrap_err();
        let late = slow.await.unwrap().unwrap_err();

        for err in [fast, late] {
            assert!(
                matches!(err, Error::Auth(AuthError::RefreshRejected { status: 400 })),
                "got {err:?}"
            );
        }
        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(unauthorized.load(Ordering::SeqCst), 1);
        assert_eq!(logouts.load(Ordering::SeqCst), 1);
        assert!(storage.snapshot().is_empty());
    }

    #[tokio::test]
    async fn calls_after_sign_out_start_over() {
        let api = MockApi::start().await;
        api.set_refresh_mode(RefreshMode::Reject(400));
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;
        let logouts = counter(pipeline.events(), AuthEventKind::Logout);

        let err = pipeline.request("/items/1", RequestOptions::get()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::RefreshRejected { status: 400 })));

        // Dispatched after the failure settled: nothing to share, and the
        // empty store has no refresh token.
        let err = pipeline.request("/items/2", RequestOptions::get()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::NoRefreshToken)), "got {err:?}");
        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_credentials_saved_meanwhile() {
        let api = MockApi::start().await;
        api.set_refresh_mode(RefreshMode::Reject(400));
        api.set_refresh_delay(Duration::from_millis(200));
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;
        let unauthorized = counter(pipeline.events(), AuthEventKind::Unauthorized);
        let logouts = counter(pipeline.events(), AuthEventKind::Logout);

        let call = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.request("/items/1", RequestOptions::get()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pipeline.is_refreshing());
        let fresh = CredentialPair::new(valid_token("B1"), "R9");
        pipeline.store().save(fresh.clone()).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::RefreshRejected { status: 400 })));
        assert_eq!(pipeline.store().credentials().await, Some(fresh));
        assert_eq!(unauthorized.load(Ordering::SeqCst), 0);
        assert_eq!(logouts.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.auth_state().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn foreign_origin_never_sees_credentials() {
        let api = MockApi::start().await;
        let other = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;
        api.accept(&valid_token("A1"));
        other.accept(&valid_token("A1"));

        let value = pipeline
            .request(&format!("{}/public", other.url), RequestOptions::get())
            .await
            .unwrap();
        assert_eq!(value["had_credentials"], false);

        // A 401 from another origin is not ours to fix.
        let err = pipeline
            .request(&format!("{}/items/1", other.url), RequestOptions::get())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(api.refresh_calls(), 0);
        assert_eq!(other.refresh_calls(), 0);

        // Absolute URLs on the API origin are still credentialed.
        let value = pipeline
            .request(&format!("{}/items/5", api.url), RequestOptions::get())
            .await
            .unwrap();
        assert_eq!(value["token"], valid_token("A1"));
    }

    #[tokio::test]
    async fn failure_statuses_propagate_with_body() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;

        let err = pipeline
            .request("/missing", RequestOptions::get())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.body().unwrap()["detail"], "Not found.");
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn malformed_success_body_is_parse_error() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&api, &storage).await;

        let err = pipeline
            .request("/broken-json", RequestOptions::get())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn no_content_is_null() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&api, &storage).await;

        let value = pipeline.request("/no-content", RequestOptions::get()).await.unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn request_json_decodes_into_type() {
        #[derive(serde::Deserialize)]
        struct Item {
            id: u64,
        }

        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;
        api.accept(&valid_token("A1"));

        let item: Item = pipeline
            .request_json("/items/42", RequestOptions::get())
            .await
            .unwrap();
        assert_eq!(item.id, 42);

        let err = pipeline
            .request_json::<Vec<u64>>("/items/42", RequestOptions::get())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[tokio::test]
    async fn best_effort_swallows_errors() {
        let api = MockApi::start().await;
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&api, &storage).await;

        assert!(
            pipeline
                .request_best_effort("/missing", RequestOptions::get())
                .await
                .is_none()
        );
        assert!(
            pipeline
                .request_best_effort("/public", RequestOptions::get())
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_network_error() {
        let storage = MemoryStorage::new();
        let store = Arc::new(
            TokenStore::load(
                Arc::new(storage),
                Arc::new(AuthEventBus::new()),
                DEFAULT_SAFETY_MARGIN,
            )
            .await,
        );
        let pipeline = RequestPipeline::new(
            reqwest::Client::new(),
            PipelineConfig::new("http://127.0.0.1:9"),
            store,
        );

        let err = pipeline.request("/items/1", RequestOptions::get()).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn auth_state_reports_refreshing() {
        let api = MockApi::start().await;
        api.set_refresh_delay(Duration::from_millis(300));
        let storage = MemoryStorage::new();
        let pipeline = revoked_session(&api, &storage).await;
        assert_eq!(pipeline.auth_state().await, AuthState::Authenticated);

        let background = pipeline.clone();
        let call = tokio::spawn(async move {
            background.request("/items/1", RequestOptions::get()).await
        });

        let mut saw_refreshing = false;
        for _ in 0..50 {
            if pipeline.auth_state().await == AuthState::Refreshing {
                saw_refreshing = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_refreshing);

        call.await.unwrap().unwrap();
        assert_eq!(pipeline.auth_state().await, AuthState::Authenticated);
    }
}
