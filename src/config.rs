//! Configuration loader and validator for the portal sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub portal: PortalConfig,
    pub sync: SyncConfig,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Remote portal endpoints, credentials and the signed-out heuristic knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortalConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub login_path: String,
    pub listing_path: String,
    pub detail_path: String,
    pub probe_path: String,
    /// Substring that only appears on the portal's sign-in page.
    pub signin_marker: String,
    /// Authenticated pages are never smaller than this.
    pub min_page_bytes: usize,
}

/// Fetch scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    pub max_concurrent: usize,
    pub request_delay_ms: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.portal.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.base_url must be non-empty"));
    }
    if !cfg.portal.base_url.starts_with("http://") && !cfg.portal.base_url.starts_with("https://") {
        return Err(ConfigError::Invalid("portal.base_url must be an http(s) URL"));
    }
    if cfg.portal.username.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.username must be non-empty"));
    }
    if cfg.portal.password.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.password must be non-empty"));
    }
    if cfg.portal.login_path.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.login_path must be non-empty"));
    }
    if cfg.portal.listing_path.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.listing_path must be non-empty"));
    }
    if cfg.portal.detail_path.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.detail_path must be non-empty"));
    }
    if cfg.portal.probe_path.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.probe_path must be non-empty"));
    }
    if cfg.portal.signin_marker.trim().is_empty() {
        return Err(ConfigError::Invalid("portal.signin_marker must be non-empty"));
    }

    if cfg.sync.max_concurrent == 0 {
        return Err(ConfigError::Invalid("sync.max_concurrent must be > 0"));
    }

    Ok(())
}

/// Example YAML configuration with every field present.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

portal:
  base_url: "https://customer.example.org"
  username: "PORTAL_USERNAME"
  password: "PORTAL_PASSWORD"
  login_path: "/user/authenticate"
  listing_path: "/customer"
  detail_path: "/customer/viewcustomer"
  probe_path: "/home"
  signin_marker: "Signin"
  min_page_bytes: 2000

sync:
  max_concurrent: 5
  request_delay_ms: 200
"#
}
