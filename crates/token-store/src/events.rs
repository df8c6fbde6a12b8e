//! Authentication lifecycle events
//!
//! A plain list of callbacks per event kind. `publish` runs on the caller's
//! task, after the state change it reports, and walks a snapshot of the
//! listeners in registration order. Each callback runs inside its own error
//! boundary: a returned error or a panic is logged and the remaining
//! listeners still receive the event.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error};

/// Kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthEventKind {
    Login,
    Logout,
    TokenRefresh,
    Unauthorized,
}

impl AuthEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEventKind::Login => "login",
            AuthEventKind::Logout => "logout",
            AuthEventKind::TokenRefresh => "token_refresh",
            AuthEventKind::Unauthorized => "unauthorized",
        }
    }
}

impl fmt::Display for AuthEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published event. Payload shape depends on the kind:
/// `login` carries the user profile, `unauthorized` carries `{"reason": ..}`,
/// the others carry `null`.
#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub payload: serde_json::Value,
}

/// Error a listener may return; it is logged, never propagated.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback registered for one event kind.
pub type Listener = Arc<dyn Fn(&AuthEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct AuthEventBus {
    listeners: Mutex<HashMap<AuthEventKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl AuthEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `kind`. Listeners run in registration order.
    pub fn subscribe<F>(&self, kind: AuthEventKind, listener: F) -> ListenerId
    where
        F: Fn(&AuthEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        debug!(event = %kind, listener = id.0, "listener subscribed");
        id
    }

    /// Remove a listener. Returns false if it was not registered for `kind`.
    pub fn unsubscribe(&self, kind: AuthEventKind, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    pub fn listener_count(&self, kind: AuthEventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to every listener currently registered for `kind`.
    ///
    /// The registry lock is released before any callback runs, so listeners
    /// may subscribe or unsubscribe from inside a callback.
    pub fn publish(&self, kind: AuthEventKind, payload: serde_json::Value) {
        let snapshot: Vec<(ListenerId, Listener)> =
            self.lock().get(&kind).cloned().unwrap_or_default();
        debug!(event = %kind, listeners = snapshot.len(), "publishing auth event");

        let event = AuthEvent { kind, payload };
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(event = %kind, listener = id.0, error = %e, "auth event listener failed");
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    error!(event = %kind, listener = id.0, panic = %message, "auth event listener panicked");
                }
            }
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<AuthEventKind, Vec<(ListenerId, Listener)>>> {
        // Listeners never run under this lock, so a poisoned guard still holds
        // a consistent registry.
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for AuthEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.lock();
        let counts: HashMap<&'static str, usize> =
            listeners.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("AuthEventBus")
            .field("listeners", &counts)
            .finish()
    }
}
