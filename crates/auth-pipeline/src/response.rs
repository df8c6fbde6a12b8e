//! Response classification and body decoding
//!
//! Separates the one status class the pipeline handles itself (credential
//! failures) from everything that propagates to the caller.

use serde_json::Value;

use crate::error::{Error, Result};

/// Statuses meaning the presented credential was missing, invalid or expired.
const AUTH_FAILURE_STATUSES: &[u16] = &[401];

/// How the pipeline treats a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// Credential rejected; eligible for refresh and one replay.
    AuthFailure,
    /// Any other failure; surfaced as `Error::Http`.
    Failure,
}

pub fn classify_status(status: u16) -> ResponseClass {
    if (200..300).contains(&status) {
        ResponseClass::Success
    } else if AUTH_FAILURE_STATUSES.contains(&status) {
        ResponseClass::AuthFailure
    } else {
        ResponseClass::Failure
    }
}

/// A fully read response.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn class(&self) -> ResponseClass {
        classify_status(self.status)
    }

    /// Turn the response into the caller's payload or a typed error.
    pub fn into_payload(self) -> Result<Value> {
        match self.class() {
            ResponseClass::Success => decode_success_body(self.content_type.as_deref(), &self.body),
            ResponseClass::AuthFailure | ResponseClass::Failure => Err(Error::Http {
                status: self.status,
                body: decode_error_body(&self.body),
            }),
        }
    }
}

/// Decode a success body.
///
/// Empty bodies are `null`. JSON bodies must parse. Non-JSON bodies are
/// returned as a string so text endpoints still work through the pipeline.
pub fn decode_success_body(content_type: Option<&str>, body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    let declared_json = content_type.is_some_and(is_json_content_type);
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => Ok(value),
        Err(e) if declared_json || content_type.is_none() => {
            Err(Error::Parse(format!("invalid JSON response body: {e}")))
        }
        Err(_) => Ok(Value::String(String::from_utf8_lossy(body).into_owned())),
    }
}

/// Best-effort decode of a failure body: JSON if possible, text otherwise.
pub fn decode_error_body(body: &[u8]) -> Option<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    serde_json::from_slice(body)
        .ok()
        .or_else(|| Some(Value::String(String::from_utf8_lossy(body).into_owned())))
}

fn is_json_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime.ends_with("+json")
}
