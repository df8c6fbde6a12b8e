//! Credential storage and authentication lifecycle events
//!
//! Holds the process's single access/refresh credential pair, persists it to
//! durable key-value storage, decodes access-token expiry, and publishes
//! lifecycle events (`login`, `logout`, `token_refresh`, `unauthorized`).
//!
//! Credential flow:
//! 1. `TokenStore::load()` reads the pair from a `TokenStorage` backend at startup
//! 2. Login or refresh calls `TokenStore::save()` → persisted, `token_refresh` emitted
//! 3. Logout or a failed refresh calls `TokenStore::clear()` → `logout` emitted
//!    if a pair was held
//! 4. `sync::spawn_sync_task()` reloads the store when another context writes storage

pub mod credentials;
pub mod error;
pub mod events;
pub mod storage;
pub mod store;
pub mod sync;
pub mod token;

pub use credentials::{ACCESS_KEY, CredentialPair, REFRESH_KEY};
pub use error::{Error, Result};
pub use events::{AuthEvent, AuthEventBus, AuthEventKind, ListenerError, ListenerId};
pub use storage::{ChangeFeed, FileStorage, MemoryStorage, StorageEntries, TokenStorage};
pub use store::TokenStore;
pub use sync::{SyncMode, spawn_sync_task};
pub use token::{DEFAULT_SAFETY_MARGIN, decode_expiry, is_expired, is_expired_at};
