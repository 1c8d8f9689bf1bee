//! Configuration for the fbas-node binary.
//!
//! Supports loading configuration from TOML files, environment variables,
//! or CLI arguments.

use std::{net::SocketAddr, path::Path, time::Duration};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// CLI arguments for fbas-node.
#[derive(Debug, Parser)]
#[command(name = "fbas-node")]
#[command(about = "Federated Byzantine agreement node over HTTP")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "FBAS_CONFIG")]
    pub config: Option<String>,

    /// Address to bind the HTTP server to.
    #[arg(long, env = "FBAS_BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: SocketAddr,

    /// This node's id. Peers reach it at this URL. Defaults to
    /// `http://<bind_addr>`.
    #[arg(long, env = "FBAS_NODE_ID")]
    pub node_id: Option<String>,

    /// This node's identity seed (used for key derivation).
    #[arg(long, env = "FBAS_IDENTITY")]
    pub identity: Option<u64>,

    /// A quorum slice as a comma-separated list of peer URLs. Repeat for
    /// each slice.
    #[arg(long = "slice", env = "FBAS_SLICES", value_delimiter = ';')]
    pub slices: Vec<String>,

    /// Nomination round duration in milliseconds.
    #[arg(long, env = "FBAS_ROUND_MS", default_value = "100")]
    pub round_ms: u64,

    /// Deferred ballot update interval in milliseconds.
    #[arg(long, env = "FBAS_DEFERRED_UPDATE_MS", default_value = "250")]
    pub deferred_update_ms: u64,

    /// Catch-up poll interval in milliseconds.
    #[arg(long, env = "FBAS_CATCHUP_INTERVAL_MS", default_value = "1000")]
    pub catchup_interval_ms: u64,
}

/// Configuration for fbas-node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind_addr: SocketAddr,

    /// This node's id, if not derived from the bind address.
    pub node_id: Option<String>,

    /// This node's identity seed for key derivation.
    pub identity: u64,

    /// Quorum slices, each a list of peer URLs.
    pub slices: Vec<Vec<String>>,

    /// Nomination round duration in milliseconds.
    pub round_ms: u64,

    /// Deferred ballot update interval in milliseconds.
    pub deferred_update_ms: u64,

    /// Catch-up poll interval in milliseconds.
    pub catchup_interval_ms: u64,

    /// Timeout for requests to peers in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            node_id: None,
            identity: 0,
            slices: Vec::new(),
            round_ms: 100,
            deferred_update_ms: 250,
            catchup_interval_ms: 1000,
            request_timeout_ms: 2000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Load configuration from CLI arguments, optionally overriding with a config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        // Start with config file if provided
        let mut config =
            if let Some(ref path) = cli.config { Self::from_file(path)? } else { Self::default() };

        // CLI args override config file values
        config.bind_addr = cli.bind_addr;

        if cli.node_id.is_some() {
            config.node_id = cli.node_id;
        }

        if let Some(identity) = cli.identity {
            config.identity = identity;
        }

        if !cli.slices.is_empty() {
            config.slices = cli.slices.iter().map(|slice| parse_slice(slice)).collect();
        }

        config.round_ms = cli.round_ms;
        config.deferred_update_ms = cli.deferred_update_ms;
        config.catchup_interval_ms = cli.catchup_interval_ms;

        Ok(config)
    }

    /// This node's id.
    pub fn node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| format!("http://{}", self.bind_addr))
    }

    /// Every peer named in any slice, sorted and deduplicated.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.slices.iter().flatten().cloned().collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Nomination round duration.
    pub const fn round_duration(&self) -> Duration {
        Duration::from_millis(self.round_ms)
    }

    /// Deferred ballot update interval.
    pub const fn deferred_update_interval(&self) -> Duration {
        Duration::from_millis(self.deferred_update_ms)
    }

    /// Catch-up poll interval.
    pub const fn catchup_interval(&self) -> Duration {
        Duration::from_millis(self.catchup_interval_ms)
    }

    /// Timeout for requests to peers.
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_slice(slice: &str) -> Vec<String> {
    slice.split(',').map(str::trim).filter(|peer| !peer.is_empty()).map(String::from).collect()
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse configuration file.
    #[error("failed to parse config: {0}")]
    Parse(toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.node_id(), "http://127.0.0.1:8080");
        assert!(config.slices.is_empty());
        assert_eq!(config.round_duration(), Duration::from_millis(100));
        assert_eq!(config.deferred_update_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_config_serde() {
        let config = Config {
            bind_addr: "0.0.0.0:9000".parse().unwrap(),
            node_id: Some("http://node1:9000".to_string()),
            identity: 42,
            slices: vec![
                vec!["http://node2:9000".to_string(), "http://node3:9000".to_string()],
                vec!["http://node3:9000".to_string()],
            ],
            ..Config::default()
        };

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.bind_addr, config.bind_addr);
        assert_eq!(parsed.slices, config.slices);
        assert_eq!(parsed.node_id(), "http://node1:9000");
        assert_eq!(parsed.peers(), vec!["http://node2:9000", "http://node3:9000"]);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            bind_addr = "127.0.0.1:9001"
            slices = [["http://127.0.0.1:9002"]]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.catchup_interval_ms, 1000);
        assert_eq!(parsed.peers(), vec!["http://127.0.0.1:9002"]);
    }

    #[test]
    fn test_cli_slices_override() {
        let cli = Cli::parse_from([
            "fbas-node",
            "--bind-addr",
            "127.0.0.1:9001",
            "--slice",
            "http://b, http://c",
            "--slice",
            "http://d",
        ]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.slices, vec![vec!["http://b", "http://c"], vec!["http://d"]]);
        assert_eq!(config.node_id(), "http://127.0.0.1:9001");
    }
}
