//! Configuration management for CustodyChain

use crate::error::{ChainError, Result};
use crate::miner::{ProofOfWork, DEFAULT_DIFFICULTY, DEFAULT_MAX_ITERATIONS, MAX_DIFFICULTY};
use rand::RngCore;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub node: NodeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Json,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_chain_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_chain_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MiningConfig {
    #[serde(default = "default_difficulty")]
    pub difficulty: usize,
    /// Iteration budget per proof search; 0 means unbounded.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    /// Address label of this node; receives mining rewards.
    #[serde(default)]
    pub identifier: Option<String>,
}

fn default_chain_path() -> String {
    "./data/chain.json".to_string()
}

fn default_difficulty() -> usize {
    DEFAULT_DIFFICULTY
}

fn default_max_iterations() -> u64 {
    DEFAULT_MAX_ITERATIONS
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.backend != StorageBackend::Memory && self.storage.path.trim().is_empty() {
            return Err(ChainError::ConfigError("storage.path must be set".to_string()));
        }
        if self.mining.difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "mining.difficulty must be at most {}, got {}",
                MAX_DIFFICULTY, self.mining.difficulty
            )));
        }
        if let Some(id) = &self.node.identifier {
            if id.trim().is_empty() {
                return Err(ChainError::ConfigError("node.identifier cannot be empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn sealer(&self) -> Result<ProofOfWork> {
        let budget = match self.mining.max_iterations {
            0 => None,
            n => Some(n),
        };
        Ok(ProofOfWork::new(self.mining.difficulty)?.with_max_iterations(budget))
    }

    /// The configured node identifier, or a fresh random label.
    pub fn node_identifier(&self) -> String {
        match &self.node.identifier {
            Some(id) => id.clone(),
            None => random_node_identifier(),
        }
    }
}

/// 128 random bits as 32 hex characters.
pub fn random_node_identifier() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Load `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let config_str = match fs::read_to_string(path.as_ref()) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => {
            return Err(ChainError::ConfigError(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            )))
        }
    };
    Config::from_toml(&config_str)
}
