//! Configuration assembly for sentinel-node

use std::path::Path;

use anyhow::{Context, Result};
use sentinel_health::ServerConfig;
use sentinel_network::{ChainConfig, SentinelConfig};

use crate::cli::Cli;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Networking configuration
    pub sentinel: SentinelConfig,
    /// Health endpoint, `None` when disabled
    pub health: Option<ServerConfig>,
}

impl NodeConfig {
    /// Build from CLI arguments, loading the chain config file if given
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let chain = match &cli.chain_config {
            Some(path) => load_chain_config(path)?,
            None => ChainConfig::default(),
        };

        let sentinel = SentinelConfig {
            addr: cli.addr.clone(),
            port: cli.port,
            tcp_port: cli.tcp_port,
            max_peers: cli.max_peers,
            private_key: cli.private_key.clone(),
            chain,
            bootnodes: cli.bootnode_list(),
            ..SentinelConfig::default()
        };
        let health = (!cli.no_health).then(|| ServerConfig::new(cli.health_addr));

        Ok(Self { sentinel, health })
    }
}

/// Load chain constants from a JSON file
pub fn load_chain_config(path: &Path) -> Result<ChainConfig> {
    tracing::info!("Loading chain config from {:?}", path);
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading chain config {}", path.display()))?;
    let config = ChainConfig::from_json(&content)
        .with_context(|| format!("parsing chain config {}", path.display()))?;
    Ok(config)
}
