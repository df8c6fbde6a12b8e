//! Access token expiry detection
//!
//! Access tokens are JWT-shaped: `header.payload.signature`, with a base64url
//! JSON payload carrying an `exp` claim in unix seconds. The claim is read
//! without verifying the signature; the server remains the authority on
//! validity. This is only used to avoid sending a credential that is already
//! dead or will die in flight.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

/// Default safety margin applied to the `exp` claim.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    exp: f64,
}

/// Decode the `exp` claim (unix seconds) from a JWT-shaped token.
///
/// Returns `None` for anything that is not three dot-separated segments with
/// a base64url JSON payload containing a numeric `exp`.
pub fn decode_expiry(token: &str) -> Option<f64> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    // Some issuers pad their segments; base64url-no-pad rejects that.
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes).ok()?;
    claim.exp.is_finite().then_some(claim.exp)
}

/// Whether `token` must be treated as expired at `now_secs`.
///
/// True when the claim cannot be decoded or when `exp <= now + margin`.
pub fn is_expired_at(token: &str, margin: Duration, now_secs: u64) -> bool {
    match decode_expiry(token) {
        Some(exp) => exp <= (now_secs as f64) + margin.as_secs_f64(),
        None => true,
    }
}

/// Whether `token` must be treated as expired now.
pub fn is_expired(token: &str, margin: Duration) -> bool {
    is_expired_at(token, margin, unix_now_secs())
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
pub(crate) fn test_token(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"alice","exp":{exp}}}"#));
    format!("{header}.{payload}.c2lnbmF0dXJl")
}
