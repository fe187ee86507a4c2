//! Configuration management for Veilchain

use crate::error::{ChainError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub miner: MinerConfig,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_data_dir")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            p2p_port: default_p2p_port(),
            api_port: default_api_port(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct MinerConfig {
    /// Worker thread count; 0 means one per available processor.
    #[serde(default)]
    pub threads: usize,
}

impl MinerConfig {
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Loads `config.toml` from the working directory, falling back to defaults
/// when the file is absent.
pub fn load_config() -> Result<Config> {
    load_config_from("config.toml")
}

pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config> {
    let text = fs::read_to_string(path).unwrap_or_default();
    let config: Config = if text.is_empty() {
        Config::default()
    } else {
        toml::from_str(&text).map_err(|e| ChainError::Config(e.to_string()))?
    };

    if config.database.path.is_empty() {
        return Err(ChainError::Config(
            "database.path must be set in config.toml".to_string(),
        ));
    }

    Ok(config)
}

fn default_data_dir() -> String {
    "./db".to_string()
}

fn default_p2p_port() -> u16 {
    8085
}

fn default_api_port() -> u16 {
    8080
}
