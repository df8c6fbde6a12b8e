//! Pipeline settings
//!
//! Endpoint paths are relative to `base_url`. Every field except `base_url`
//! has a default so a minimal `[api]` table only needs the base URL.
//!
//! Absolute endpoints are allowed, but only those on the `base_url` origin
//! are sent with credentials (see [`PipelineConfig::is_api_origin`]).

use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub base_url: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_register_path")]
    pub register_path: String,
    /// Server-side session revocation; skipped when unset.
    #[serde(default)]
    pub logout_path: Option<String>,
    /// Tokens expiring within this many seconds are treated as expired.
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
}

fn default_refresh_path() -> String {
    "/auth/refresh".to_string()
}

fn default_login_path() -> String {
    "/auth/login".to_string()
}

fn default_register_path() -> String {
    "/auth/register".to_string()
}

fn default_safety_margin_secs() -> u64 {
    30
}

impl PipelineConfig {
    /// Config with default paths for the given API root.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: default_refresh_path(),
            login_path: default_login_path(),
            register_path: default_register_path(),
            logout_path: None,
            safety_margin_secs: default_safety_margin_secs(),
        }
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    /// Resolve an endpoint against `base_url`. Absolute URLs pass through.
    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if endpoint.starts_with('/') {
            format!("{base}{endpoint}")
        } else {
            format!("{base}/{endpoint}")
        }
    }

    pub fn refresh_url(&self) -> String {
        self.url(&self.refresh_path)
    }

    /// Whether `url` shares scheme, host and port with `base_url`.
    ///
    /// Unparseable URLs are never the API origin.
    pub fn is_api_origin(&self, url: &str) -> bool {
        match (Url::parse(&self.base_url), Url::parse(url)) {
            (Ok(base), Ok(target)) => base.origin() == target.origin(),
            _ => false,
        }
    }
}
