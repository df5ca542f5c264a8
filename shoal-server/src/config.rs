use serde::{Deserialize, Serialize};
use shoal_core::{Node, Result, ShoalError};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub my_node: NodeConfig,
    #[serde(default)]
    pub neighbors: Vec<NodeConfig>,
    pub upload_directory: PathBuf,
    #[serde(default = "default_replication")]
    pub replication: usize,
    #[serde(default = "default_min_replication")]
    pub min_replication: usize,
    #[serde(default = "default_resize_workers")]
    pub num_resize_workers: usize,
    #[serde(default = "default_gossiper_sleep")]
    pub gossiper_sleep: u64,
    #[serde(default)]
    pub upload_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub nickname: String,
    pub uuid: String,
    pub base_url: String,
    #[serde(default)]
    pub location: String,
    #[serde(default = "default_writeable")]
    pub writeable: bool,
}

impl NodeConfig {
    pub fn to_node(&self) -> Node {
        Node::new(
            &self.nickname,
            &self.uuid,
            &self.base_url,
            &self.location,
            self.writeable,
        )
    }
}

fn default_replication() -> usize {
    1
}

fn default_min_replication() -> usize {
    1
}

fn default_resize_workers() -> usize {
    4
}

fn default_gossiper_sleep() -> u64 {
    60
}

fn default_writeable() -> bool {
    true
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("SHOAL"))
            .build()
            .map_err(|e| ShoalError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ShoalError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn key_required(&self) -> bool {
        !self.upload_keys.is_empty()
    }

    pub fn valid_key(&self, key: &str) -> bool {
        self.upload_keys.iter().any(|known| known == key)
    }
}
