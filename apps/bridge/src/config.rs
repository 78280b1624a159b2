//! Bridge configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/watchmqtt/bridge.toml`
//! - Windows: `%APPDATA%/watchmqtt/bridge.toml`
//!
//! A path given on the command line takes precedence. Credentials may be
//! overridden with `WATCHMQTT_USERNAME` and `WATCHMQTT_PASSWORD`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use watchmqtt_connection::types::DEFAULT_CLIENT_ID_PREFIX;
use watchmqtt_connection::{ConnectionError, ConnectionParams, ReconnectConfig, generate_client_id};
use watchmqtt_protocol::constants::DEFAULT_KEEP_ALIVE;
use watchmqtt_relay::{DEFAULT_RELAY_PORT, LINK_RETRY_INTERVAL};

const USERNAME_ENV: &str = "WATCHMQTT_USERNAME";
const PASSWORD_ENV: &str = "WATCHMQTT_PASSWORD";

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Prefix of the per-launch MQTT client identifier.
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// Topic filter to subscribe to.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// MQTT keep-alive advertised in CONNECT, in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

/// Where the MQTT broker listens for WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket path, `/` is prefixed when missing.
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

/// Link to the companion device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_peer_addr")]
    pub peer_addr: SocketAddr,

    /// Where the last undelivered payload is kept. Memory only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_path: Option<PathBuf>,

    /// Seconds between link attempts while the peer is unreachable.
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
}

/// Automatic reconnection after an unexpected loss. Off by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_client_id_prefix() -> String {
    DEFAULT_CLIENT_ID_PREFIX.into()
}

fn default_topic() -> String {
    "home/button".into()
}

fn default_keep_alive() -> u16 {
    DEFAULT_KEEP_ALIVE
}

fn default_host() -> String {
    "localhost".into()
}

fn default_port() -> u16 {
    9001
}

fn default_path() -> String {
    "/mqtt".into()
}

fn default_peer_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_RELAY_PORT))
}

fn default_retry_secs() -> u64 {
    LINK_RETRY_INTERVAL.as_secs()
}

fn default_initial_delay_ms() -> u64 {
    ReconnectConfig::default().initial_delay.as_millis() as u64
}

fn default_max_delay_secs() -> u64 {
    ReconnectConfig::default().max_delay.as_secs()
}

fn default_backoff_factor() -> f64 {
    ReconnectConfig::default().backoff_factor
}

fn default_max_attempts() -> u32 {
    ReconnectConfig::default().max_attempts
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id_prefix: default_client_id_prefix(),
            topic: default_topic(),
            keep_alive: default_keep_alive(),
            broker: BrokerConfig::default(),
            relay: RelayConfig::default(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            peer_addr: default_peer_addr(),
            context_path: None,
            retry_secs: default_retry_secs(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            backoff_factor: default_backoff_factor(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the platform default), creating
    /// a default file if none exists, then applies environment overrides.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p,
            None => config_path()?,
        };
        let mut config = Self::load_from(&path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration read");
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            tracing::info!(path = %path.display(), "default configuration written");
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

        // Credentials live here.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(username) = lookup(USERNAME_ENV) {
            self.broker.username = username;
        }
        if let Some(password) = lookup(PASSWORD_ENV) {
            self.broker.password = password;
        }
    }

    /// Connection parameters with a fresh client identifier.
    pub fn connection_params(&self) -> Result<ConnectionParams, ConnectionError> {
        Ok(ConnectionParams::new(
            self.broker.host.as_str(),
            self.broker.port,
            &self.broker.path,
            generate_client_id(&self.client_id_prefix),
            self.topic.as_str(),
        )?
        .with_credentials(self.broker.username.as_str(), self.broker.password.as_str())
        .with_keep_alive(self.keep_alive))
    }

    pub fn reconnect_config(&self) -> Option<ReconnectConfig> {
        let r = &self.reconnect;
        r.enabled.then(|| ReconnectConfig {
            initial_delay: Duration::from_millis(r.initial_delay_ms),
            max_delay: Duration::from_secs(r.max_delay_secs),
            backoff_factor: r.backoff_factor,
            max_attempts: r.max_attempts,
        })
    }

    pub fn relay_retry_interval(&self) -> Duration {
        Duration::from_secs(self.relay.retry_secs.max(1))
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("watchmqtt").join("bridge.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("watchmqtt")
            .join("bridge.toml"))
    }
}
