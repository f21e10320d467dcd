//! Client configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/handtalk/client.toml`
//! - Windows: `%APPDATA%/handtalk/client.toml`
//!
//! `HANDTALK_BASE_URL` and `HANDTALK_IDENTITY` override the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use handtalk_connection::ConnectionConfig;
use handtalk_protocol::constants::SKIP_BROWSER_WARNING_HEADER;

const ENV_BASE_URL: &str = "HANDTALK_BASE_URL";
const ENV_IDENTITY: &str = "HANDTALK_IDENTITY";

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Backend endpoint prefix; the identity is appended to it.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Identity this client connects as (random UUID by default).
    #[serde(default = "default_identity")]
    pub identity: String,

    /// Extra headers sent with the WebSocket handshake.
    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,

    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Delay before reconnecting after a failure, in seconds.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Upper bound for the close handshake, in seconds.
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

fn default_base_url() -> String {
    "ws://localhost:8000/ws/".into()
}

fn default_identity() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([(SKIP_BROWSER_WARNING_HEADER.to_string(), "true".to_string())])
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_close_timeout_secs() -> u64 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            identity: default_identity(),
            headers: default_headers(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            close_timeout_secs: default_close_timeout_secs(),
        }
    }
}

impl ClientConfig {
    /// Loads configuration from disk, or creates a default if not found,
    /// then applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from(&config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads configuration from `path`, writing defaults there if absent.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Replaces fields with values from `lookup`, keyed by environment
    /// variable name. Empty values are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.base_url = url;
        }
        if let Some(identity) = lookup(ENV_IDENTITY).filter(|v| !v.is_empty()) {
            self.identity = identity;
        }
    }

    /// Connection settings for the manager.
    pub fn to_connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(self.base_url.clone());
        config.headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        config.heartbeat_period = Duration::from_secs(self.heartbeat_secs.max(1));
        config.reconnect_delay = Duration::from_secs(self.reconnect_delay_secs);
        config.close_timeout = Duration::from_secs(self.close_timeout_secs);
        config
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("handtalk")
            .join("client.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("handtalk").join("client.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/handtalk/client.toml"))
    }
}
