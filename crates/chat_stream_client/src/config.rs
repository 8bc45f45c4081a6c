//! Client config load/save for `~/.chat-stream/config.yaml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::connection::ReconnectPolicy;
use crate::error::ConfigError;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8000/ws";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_TOTAL_TIMEOUT_MS: u64 = 300_000;

/// Server section (WebSocket endpoint).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Auth section (bearer token attached to the connection).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AuthSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Connection section (reconnect backoff and handshake bound).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConnectionSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

/// Exchange section (per-prompt timeouts).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ExchangeSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub exchange: ExchangeSection,
}

/// Validated runtime settings for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub url: Url,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub total_timeout: Duration,
}

impl ClientSettings {
    /// Settings for `url` with default backoff and timeouts.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            total_timeout: Duration::from_millis(DEFAULT_TOTAL_TIMEOUT_MS),
        }
    }
}

impl Config {
    /// Resolve defaults and validate the endpoint.
    pub fn client_settings(&self) -> Result<ClientSettings, ConfigError> {
        let raw = self.server.url.as_deref().unwrap_or(DEFAULT_SERVER_URL);
        let url = Url::parse(raw)
            .map_err(|e| ConfigError::Invalid(format!("server.url {:?}: {}", raw, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid(format!(
                "server.url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        let mut settings = ClientSettings::new(url);
        let defaults = settings.reconnect;
        settings.reconnect = ReconnectPolicy {
            base_delay: self
                .connection
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: self
                .connection
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            max_attempts: self.connection.max_attempts.unwrap_or(defaults.max_attempts),
        };
        if let Some(ms) = self.connection.connect_timeout_ms {
            settings.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.exchange.idle_timeout_ms {
            settings.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.exchange.total_timeout_ms {
            settings.total_timeout = Duration::from_millis(ms);
        }
        Ok(settings)
    }
}

/// Returns the default config file path: `~/.chat-stream/config.yaml` (platform-specific).
pub fn default_config_path() -> Option<PathBuf> {
    let home = home_dir()?;
    Some(home.join(".chat-stream").join("config.yaml"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

/// Load config from a YAML file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}
