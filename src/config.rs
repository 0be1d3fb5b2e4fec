//! Configuration management for the ledger node

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::blockchain::proof::{default_workers, MiningOptions, DEFAULT_CHUNK_SIZE};

/// Config file read when none is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "ledger.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of the block store
    pub data_dir: PathBuf,

    /// JSON file holding the wallet keypairs
    pub wallet_file: PathBuf,

    pub mining: MiningConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub workers: usize,
    pub chunk_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./tmp/blocks"),
            wallet_file: PathBuf::from("./tmp/wallets.json"),
            mining: MiningConfig::default(),
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        MiningConfig {
            workers: default_workers(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MiningConfig {
    pub fn options(&self) -> MiningOptions {
        MiningOptions {
            workers: self.workers,
            chunk_size: self.chunk_size,
        }
    }
}

impl Config {
    /// Checks the values the node cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must be set".to_string()));
        }
        if self.wallet_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("wallet_file must be set".to_string()));
        }
        if self.mining.workers == 0 {
            return Err(ConfigError::Invalid("mining.workers must be at least 1".to_string()));
        }
        if self.mining.chunk_size == 0 {
            return Err(ConfigError::Invalid("mining.chunk_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Parses and validates a config from TOML text
pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

/// Loads the config at `path`, falling back to defaults when the file is absent
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&text)
}
