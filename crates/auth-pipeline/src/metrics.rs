//! Pipeline metrics
//!
//! - `auth_requests_total` (counter): label `status`
//! - `auth_refresh_total` (counter): label `outcome` (`success` | `failure`)
//! - `auth_queued_requests_total` (counter): calls that waited on another
//!   call's refresh
//! - `auth_replayed_requests_total` (counter): calls replayed after a 401
//!
//! Recording is a no-op until the embedding process installs a recorder.

/// Record a completed HTTP exchange, replays included.
pub fn record_request(status: u16) {
    metrics::counter!("auth_requests_total", "status" => status.to_string()).increment(1);
}

/// Record a finished refresh.
pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("auth_refresh_total", "outcome" => outcome).increment(1);
}

pub fn record_queued() {
    metrics::counter!("auth_queued_requests_total").increment(1);
}

pub fn record_replay() {
    metrics::counter!("auth_replayed_requests_total").increment(1);
}
