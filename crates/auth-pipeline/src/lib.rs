//! Authenticated HTTP calls with single-flight credential refresh
//!
//! Every API facade routes its calls through one shared [`RequestPipeline`]
//! (usually via [`AuthContext`]). The pipeline attaches the stored bearer
//! token, and when the server answers 401 it refreshes the token once for
//! all concurrent callers and replays each call exactly once.
//!
//! Request flow:
//! 1. Caller → `AuthContext::request(endpoint, options)`
//! 2. Pipeline attaches `Authorization: Bearer <access>` if the token is valid
//! 3. 2xx → decoded JSON payload; non-401 failure → `Error::Http`
//! 4. 401 → join or start the refresh → replay once with the new token
//! 5. Refresh failure → store cleared, `unauthorized` emitted, every waiter
//!    rejected with the refresh error

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod options;
pub mod pipeline;
pub mod refresh;
pub mod response;
mod session;

#[cfg(test)]
mod mock;

pub use config::PipelineConfig;
pub use context::AuthContext;
pub use error::{AuthError, Error, Result};
pub use options::RequestOptions;
pub use pipeline::{AuthState, RequestPipeline};
pub use refresh::RefreshCoordinator;
pub use response::{ResponseClass, classify_status};
