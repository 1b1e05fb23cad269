//! Configuration for a container node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use caravan_id::ContainerName;

/// Container node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of this container. Must be unique across the platform.
    pub node_name: ContainerName,

    /// Address the wire listener binds to.
    pub listen_addr: SocketAddr,

    /// Name of the main container (the one holding the global directory).
    pub main_container: ContainerName,

    /// Known peers, name to address. The main container must be listed here
    /// unless this node is the main container itself.
    pub peers: Vec<(ContainerName, SocketAddr)>,

    /// Directory holding this node's code module registry.
    pub code_registry_dir: PathBuf,

    /// Extra code search paths: directories or `.tar.gz` bundles, scanned in
    /// order after the registry.
    pub code_paths: Vec<PathBuf>,

    /// Timeout for readiness and liveness probes, in milliseconds.
    pub probe_timeout_ms: u64,

    /// Timeout for an ordinary wire call, in milliseconds.
    pub call_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let node_name: ContainerName = std::env::var("CARAVAN_NODE_NAME")
            .unwrap_or_else(|_| "main".to_string())
            .parse()
            .context("invalid CARAVAN_NODE_NAME")?;

        let listen_addr: SocketAddr = std::env::var("CARAVAN_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:7400".to_string())
            .parse()
            .context("invalid CARAVAN_LISTEN_ADDR")?;

        let main_container: ContainerName = std::env::var("CARAVAN_MAIN_CONTAINER")
            .unwrap_or_else(|_| "main".to_string())
            .parse()
            .context("invalid CARAVAN_MAIN_CONTAINER")?;

        let peers = match std::env::var("CARAVAN_PEERS") {
            Ok(raw) => parse_peers(&raw)?,
            Err(_) => Vec::new(),
        };

        let code_registry_dir = PathBuf::from(
            std::env::var("CARAVAN_CODE_REGISTRY_DIR").unwrap_or_else(|_| "./code".to_string()),
        );

        let code_paths = std::env::var("CARAVAN_CODE_PATHS")
            .map(|raw| raw.split(':').map(PathBuf::from).collect())
            .unwrap_or_default();

        let probe_timeout_ms = std::env::var("CARAVAN_PROBE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);

        let call_timeout_ms = std::env::var("CARAVAN_CALL_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        let log_level = std::env::var("CARAVAN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_name,
            listen_addr,
            main_container,
            peers,
            code_registry_dir,
            code_paths,
            probe_timeout_ms,
            call_timeout_ms,
            log_level,
        })
    }

    /// True if this node hosts the global agent directory.
    pub fn is_main(&self) -> bool {
        self.node_name == self.main_container
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Parses the `CARAVAN_PEERS` format: `name=host:port` entries separated by
/// commas.
fn parse_peers(raw: &str) -> Result<Vec<(ContainerName, SocketAddr)>> {
    let mut peers = Vec::new();
    for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
        let (name, addr) = entry
            .split_once('=')
            .with_context(|| format!("peer entry '{}' is not name=addr", entry))?;
        let name: ContainerName = name
            .trim()
            .parse()
            .with_context(|| format!("invalid peer name in '{}'", entry))?;
        let addr: SocketAddr = addr
            .trim()
            .parse()
            .with_context(|| format!("invalid peer address in '{}'", entry))?;
        peers.push((name, addr));
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peers() {
        let peers = parse_peers("c1=127.0.0.1:7401, c2=127.0.0.1:7402").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].0.as_str(), "c1");
        assert_eq!(peers[1].1.port(), 7402);
    }

    #[test]
    fn test_parse_peers_rejects_malformed_entry() {
        assert!(parse_peers("c1:127.0.0.1:7401").is_err());
        assert!(parse_peers("c1=not-an-addr").is_err());
    }

    #[test]
    fn test_parse_peers_empty() {
        assert!(parse_peers("").unwrap().is_empty());
    }
}
