//! Cross-context credential convergence
//!
//! Several processes (or several stores in one process) may share the same
//! durable storage. This background task keeps one `TokenStore` in step with
//! writes made by the others: it reloads on the backend's change feed and,
//! when the backend has none or the watcher cannot start, falls back to
//! polling on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::storage::TokenStorage;
use crate::store::TokenStore;

/// How a sync task learns about storage changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Reload on change notifications from the backend.
    Notify,
    /// Reload on a fixed interval.
    Poll,
}

/// Spawn a task that reloads `store` whenever `storage` changes.
///
/// `storage` must be the backend `store` was loaded from. Returns the mode in
/// use alongside the `JoinHandle`; abort the handle to stop syncing.
pub fn spawn_sync_task(
    store: Arc<TokenStore>,
    storage: Arc<dyn TokenStorage>,
    poll_interval: Duration,
) -> (SyncMode, tokio::task::JoinHandle<()>) {
    match storage.watch() {
        Ok(Some(mut feed)) => {
            info!(storage = %storage.describe(), "credential sync using change notifications");
            let handle = tokio::spawn(async move {
                while feed.changed().await.is_some() {
                    sync_once(&store).await;
                }
                debug!("storage change feed closed, credential sync stopped");
            });
            (SyncMode::Notify, handle)
        }
        Ok(None) => (SyncMode::Poll, spawn_poll(store, storage, poll_interval)),
        Err(e) => {
            warn!(error = %e, "storage watcher unavailable, falling back to polling");
            (SyncMode::Poll, spawn_poll(store, storage, poll_interval))
        }
    }
}

fn spawn_poll(
    store: Arc<TokenStore>,
    storage: Arc<dyn TokenStorage>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    info!(
        storage = %storage.describe(),
        interval_ms = interval.as_millis() as u64,
        "credential sync polling storage"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; the store was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sync_once(&store).await;
        }
    })
}

/// Run one reload, logging instead of failing so the task keeps going.
async fn sync_once(store: &TokenStore) {
    match store.reload().await {
        Ok(true) => debug!("credential sync applied external change"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "credential sync failed to read storage, will retry"),
    }
}
