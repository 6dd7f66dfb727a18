//! Configuration management for NetherChain

use crate::crypto::Address;
use crate::error::ChainError;
use crate::network::SyncMode;
use crate::sync::SyncConfig;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub genesis: GenesisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_io_timeout", deserialize_with = "duration_str")]
    pub io_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            p2p_port: default_p2p_port(),
            bootstrap_peers: Vec::new(),
            is_root: false,
            sync_mode: SyncMode::Default,
            max_peers: default_max_peers(),
            io_timeout: default_io_timeout(),
        }
    }
}

impl NetworkConfig {
    /// Address announced to peers.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.p2p_port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_data_dir")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub beneficiary_address: String,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default, deserialize_with = "optional_duration_str")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_min_pending")]
    pub min_pending: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            beneficiary_address: String::new(),
            threads: default_threads(),
            timeout: None,
            min_pending: default_min_pending(),
        }
    }
}

impl MinerConfig {
    /// Parsed beneficiary, `None` when left empty.
    pub fn beneficiary(&self) -> Result<Option<Address>, ChainError> {
        if self.beneficiary_address.is_empty() {
            return Ok(None);
        }
        Address::decode(&self.beneficiary_address).map(Some)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenesisConfig {
    /// Genesis JSON used the first time a data directory is opened.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, ChainError> {
        let config: Config =
            toml::from_str(text).map_err(|e| ChainError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ChainError::ConfigError("database.path must be set".to_string()));
        }
        if self.network.listen_host.is_empty() {
            return Err(ChainError::ConfigError("network.listen_host must be set".to_string()));
        }
        if self.network.max_peers == 0 {
            return Err(ChainError::ConfigError("network.max_peers must be at least 1".to_string()));
        }
        if self.miner.threads == 0 {
            return Err(ChainError::ConfigError("miner.threads must be at least 1".to_string()));
        }
        let beneficiary = self
            .miner
            .beneficiary()
            .map_err(|e| ChainError::ConfigError(format!("miner.beneficiary_address: {}", e)))?;
        if self.miner.enabled && beneficiary.is_none() {
            return Err(ChainError::ConfigError(
                "miner.beneficiary_address must be set when mining is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Sync settings derived from the `[network]` and `[miner]` tables.
    pub fn sync_config(&self) -> Result<SyncConfig, ChainError> {
        Ok(SyncConfig {
            is_root: self.network.is_root,
            sync_mode: self.network.sync_mode,
            mining_enabled: self.miner.enabled,
            miner_address: self.miner.beneficiary()?,
            min_pending: self.miner.min_pending,
            mining_threads: self.miner.threads,
            mining_timeout: self.miner.timeout,
            ..SyncConfig::default()
        })
    }
}

/// Reads `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<Config, ChainError> {
    match fs::read_to_string(path) {
        Ok(text) => Config::from_toml(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
        Err(e) => Err(ChainError::ConfigError(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn duration_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

fn optional_duration_str<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    duration_str(deserializer).map(Some)
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_p2p_port() -> u16 {
    3000
}

fn default_max_peers() -> usize {
    crate::network::PeerSet::DEFAULT_MAX_PEERS
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".netherchain"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn default_threads() -> usize {
    1
}

fn default_min_pending() -> usize {
    2
}
