//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! `API_BASE_URL` overrides `[api].base_url` so one config file can be
//! pointed at staging or production.

use auth_pipeline::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Durable credential storage
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_token_path")]
    pub path: PathBuf,
    /// Fallback interval for picking up credentials written by other
    /// processes when file notifications are unavailable.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_token_path(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl StorageConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_token_path() -> PathBuf {
    PathBuf::from("api-client-tokens.json")
}

fn default_poll_interval() -> u64 {
    5
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(base_url) = std::env::var("API_BASE_URL") {
            config.api.base_url = base_url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.api.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {base_url}"
            )));
        }

        let mut paths = vec![
            ("refresh_path", self.api.refresh_path.as_str()),
            ("login_path", self.api.login_path.as_str()),
            ("register_path", self.api.register_path.as_str()),
        ];
        if let Some(logout) = &self.api.logout_path {
            paths.push(("logout_path", logout.as_str()));
        }
        for (name, path) in paths {
            if !path.starts_with('/') {
                return Err(common::Error::Config(format!(
                    "{name} must be an absolute path starting with '/', got: {path:?}"
                )));
            }
        }

        if self.storage.poll_interval_secs == 0 {
            return Err(common::Error::Config(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.storage.path.as_os_str().is_empty() {
            return Err(common::Error::Config("storage path must not be empty".into()));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("api-client.toml")
    }
}
