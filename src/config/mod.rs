//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors detected after parsing
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid socket mode {0:?}: expected an octal string such as \"0666\"")]
    InvalidMode(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub socket: SocketConfig,
    pub retry: RetryConfig,
}

/// General settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Socket directory
    pub runtime_dir: Option<PathBuf>,
}

/// Socket file settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Permission bits applied once listening, as an octal string
    pub mode: String,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            mode: "0666".to_string(),
        }
    }
}

/// Orphan retry settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total bind attempts before giving up; unset retries forever
    pub max_attempts: Option<u32>,

    /// Delay before each retry in milliseconds
    pub backoff_ms: u64,
}

impl Config {
    /// Load config from the default location, or return defaults if not found
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load config from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {:?}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("failed to parse config {:?}", path))?;
        Ok(config)
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("proxiable")
            .join("config.toml")
    }

    /// Get the runtime directory for sockets
    pub fn runtime_dir(&self) -> PathBuf {
        self.general
            .runtime_dir
            .clone()
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("proxiable")
    }

    /// Get the default socket path for a named server
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.runtime_dir().join(format!("{}.sock", name))
    }

    /// Parsed socket mode
    pub fn socket_mode(&self) -> Result<u32, ConfigError> {
        parse_mode(&self.socket.mode)
    }
}

fn parse_mode(raw: &str) -> Result<u32, ConfigError> {
    let digits = raw.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if !digits.is_empty() && mode <= 0o7777 => Ok(mode),
        _ => Err(ConfigError::InvalidMode(raw.to_string())),
    }
}
