//! Per-call descriptor
//!
//! `RequestOptions` is immutable once a call is dispatched. The pipeline
//! derives the replay descriptor with [`RequestOptions::into_replay`] instead
//! of flipping a flag on shared state, so the "already retried" marker
//! belongs to exactly one call.

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct RequestOptions {
    method: Method,
    body: Option<Value>,
    headers: HeaderMap,
    with_credentials: bool,
    allow_refresh: bool,
    retried: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            headers: HeaderMap::new(),
            with_credentials: true,
            allow_refresh: true,
            retried: false,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post(body: Value) -> Self {
        Self::new(Method::POST).json(body)
    }

    pub fn put(body: Value) -> Self {
        Self::new(Method::PUT).json(body)
    }

    pub fn patch(body: Value) -> Self {
        Self::new(Method::PATCH).json(body)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    /// Set the JSON request body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a header. `Authorization` is ignored at send time: the pipeline
    /// owns the credential header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Send without a credential and never refresh on 401 (login,
    /// registration, public endpoints).
    pub fn without_credentials(mut self) -> Self {
        self.with_credentials = false;
        self.allow_refresh = false;
        self
    }

    /// Attach the credential but surface a 401 directly instead of
    /// refreshing (logout, where a refresh would be wasted).
    pub fn without_refresh(mut self) -> Self {
        self.allow_refresh = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn sends_credentials(&self) -> bool {
        self.with_credentials
    }

    /// Whether a 401 on this call may start (or wait for) a refresh.
    pub fn may_refresh(&self) -> bool {
        self.with_credentials && self.allow_refresh && !self.retried
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// The descriptor for the single replay after a refresh.
    pub(crate) fn into_replay(self) -> Self {
        Self {
            retried: true,
            ..self
        }
    }
}
