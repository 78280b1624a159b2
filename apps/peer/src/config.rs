//! Companion configuration, stored as `peer.toml` next to the bridge's.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use watchmqtt_relay::DEFAULT_RELAY_PORT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the relay receiver binds, `host:port`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{DEFAULT_RELAY_PORT}")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Config {
    /// Loads `path` (or the platform default), writing defaults when missing.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p,
            None => config_path(),
        };
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Config::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, toml::to_string_pretty(&config)?)?;
            tracing::info!(path = %path.display(), "default configuration written");
            Ok(config)
        }
    }
}

fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("watchmqtt").join("peer.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("watchmqtt")
            .join("peer.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listens_on_relay_port() {
        assert_eq!(Config::default().listen_addr, "0.0.0.0:47901");
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn missing_file_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peer.toml");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());

        std::fs::write(&path, "listen_addr = \"127.0.0.1:5000\"\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:5000");
    }
}
