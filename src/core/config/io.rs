use crate::core::config::data::{path_display, PoolConfig};
use directories::ProjectDirs;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when loading configuration from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("Failed to read config at {}: {source}", path_display(.path))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    #[error("Failed to parse config at {}: {source}", path_display(.path))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// The file parsed but describes an unusable pool.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl PoolConfig {
    pub fn load_from_path(config_path: &Path) -> Result<PoolConfig, ConfigError> {
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        let config: PoolConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(ConfigError::Invalid("server name must not be empty".to_string()));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }
            if server.is_connectable() {
                let url = reqwest::Url::parse(&server.base_url).map_err(|err| {
                    ConfigError::Invalid(format!("server {} has invalid base_url: {err}", server.name))
                })?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ConfigError::Invalid(format!(
                        "server {} base_url must be http or https",
                        server.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// `<config dir>/mcpool/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "mcpool", "mcpool")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Where the CLI keeps its key-value store when none is given.
    pub fn default_store_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "mcpool", "mcpool")
            .map(|dirs| dirs.data_dir().join("store.json"))
    }
}
