//! CLI argument parsing for sentinel-node

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Beacon-chain light client p2p node
#[derive(Parser, Debug, Clone)]
#[command(name = "sentinel")]
#[command(about = "Beacon-chain light client p2p node")]
#[command(version)]
pub struct Cli {
    /// Advertised IP address
    #[arg(long, default_value = "127.0.0.1")]
    pub addr: String,

    /// Discovery UDP port
    #[arg(long, default_value = "7777")]
    pub port: u16,

    /// Transport TCP port
    #[arg(long, default_value = "4000")]
    pub tcp_port: u16,

    /// Maximum admitted peers
    #[arg(long, default_value = "80")]
    pub max_peers: usize,

    /// Chain config JSON file (fork digest, size limits, bootnodes)
    #[arg(long)]
    pub chain_config: Option<PathBuf>,

    /// Seed records (comma-separated, e.g. "enr:f8..,enr:f9..")
    #[arg(long, default_value = "")]
    pub bootnodes: String,

    /// Node private key (hex); a fresh key is generated when omitted
    #[arg(long, env = "SENTINEL_PRIVATE_KEY")]
    pub private_key: Option<String>,

    /// Health endpoint listen address
    #[arg(long, default_value = "127.0.0.1:5555")]
    pub health_addr: SocketAddr,

    /// Disable the health endpoint
    #[arg(long)]
    pub no_health: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Seed records from `--bootnodes`
    pub fn bootnode_list(&self) -> Vec<String> {
        self.bootnodes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}
