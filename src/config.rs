//! TOML configuration: the listen address and the ordered upstream list.

use crate::pool::{normalize_host, Upstream, UpstreamKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_enabled() -> bool {
    true
}

/// One upstream as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub name: String,
    pub host: String,
    pub api_key: String,
    #[serde(default = "default_kind")]
    pub kind: UpstreamKind,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub remark: String,
}

fn default_kind() -> UpstreamKind {
    UpstreamKind::Claude
}

impl AppConfig {
    /// Default config location: `~/.claude-relay/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("could not find home directory".to_string()))?;
        Ok(home.join(".claude-relay").join("config.toml"))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// The same rules the pool enforces, checked up-front so a bad file
    /// fails at startup instead of on the first request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        let pool = crate::pool::EndpointPool::new();
        pool.replace(self.upstreams())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// The endpoint list as pool upstreams, hosts normalized.
    pub fn upstreams(&self) -> Vec<Upstream> {
        self.endpoints
            .iter()
            .map(|e| Upstream {
                name: e.name.clone(),
                host: normalize_host(&e.host),
                api_key: e.api_key.clone(),
                kind: e.kind,
                default_model: e.default_model.clone(),
                enabled: e.enabled,
                remark: e.remark.clone(),
            })
            .collect()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            endpoints: Vec::new(),
        }
    }
}
