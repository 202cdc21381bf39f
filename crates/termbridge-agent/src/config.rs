//! Agent configuration, stored as TOML under the user's config directory.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER_URL: &str = "https://termbridge.dev";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the termbridge cloud server.
    pub server_url: String,
    /// API key used to authenticate the agent connection.
    pub api_key: String,
    /// Persistent UUID identifying this machine.
    pub machine_id: String,
    /// Human-readable label for this machine.
    pub machine_name: String,
    /// Logging verbosity: debug, info, warn, error.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_key: String::new(),
            machine_id: String::new(),
            machine_name: String::new(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Config directory, XDG first with HOME fallback.
pub fn config_dir() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_home).join("termbridge")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("termbridge")
    } else {
        PathBuf::from("/tmp/termbridge")
    }
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl Config {
    /// Load from the default path; a missing file yields the defaults.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// The agent refuses to run without credentials and an identity.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.machine_id.is_empty()
    }

    /// WebSocket endpoint derived from the server URL and API key.
    pub fn websocket_url(&self) -> String {
        format!(
            "{}/api/ws/agent?key={}",
            rewrite_ws_scheme(&self.server_url),
            self.api_key
        )
    }
}

/// Rewrite an HTTP base URL to its WebSocket equivalent. Identity on URLs
/// that already carry a ws scheme.
pub fn rewrite_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
