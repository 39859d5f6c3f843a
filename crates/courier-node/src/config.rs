//! Configuration types for courier-node.
//! Parsed from a TOML file; every section and field has a default.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::NodeError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub connect: ConnectSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Peers that must be registered before the entry action runs.
    #[serde(default = "default_wait_for")]
    pub wait_for: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            wait_for: default_wait_for(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkSection {
    /// Peers to connect to at startup.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub addr: String,
}

impl PeerEntry {
    /// Split `host:port`. IPv6 literals may be bracketed: `[::1]:9000`.
    pub fn host_port(&self) -> Result<(String, u16), NodeError> {
        let (host, port) = self
            .addr
            .rsplit_once(':')
            .ok_or_else(|| NodeError::InvalidConfig(format!("peer {:?} has no port", self.addr)))?;
        let port: u16 = port
            .parse()
            .map_err(|e| NodeError::InvalidConfig(format!("peer {:?}: bad port: {e}", self.addr)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(NodeError::InvalidConfig(format!(
                "peer {:?} has no host",
                self.addr
            )));
        }
        Ok((host.to_string(), port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectSection {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ConnectSection {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    /// Upper bound on how long the dispatch loop sleeps before re-checking
    /// the stop flag when both queues are empty.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            idle_wait_ms: default_idle_wait_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Fixed-delay retry schedule for outbound connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0:9000".into()
}
fn default_wait_for() -> usize {
    1
}
fn default_attempts() -> u32 {
    64
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_idle_wait_ms() -> u64 {
    100
}
fn default_max_frame_bytes() -> usize {
    courier_protocol::DEFAULT_MAX_FRAME_BYTES
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        self.listen_addr()?;
        if self.node.wait_for == 0 {
            return Err(NodeError::InvalidConfig("wait_for must be at least 1".into()));
        }
        if self.connect.attempts == 0 {
            return Err(NodeError::InvalidConfig(
                "connect.attempts must be at least 1".into(),
            ));
        }
        if self.dispatch.idle_wait_ms == 0 {
            return Err(NodeError::InvalidConfig(
                "dispatch.idle_wait_ms must be at least 1".into(),
            ));
        }
        for peer in &self.network.peers {
            peer.host_port()?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, NodeError> {
        self.node.listen_addr.parse().map_err(|e| {
            NodeError::InvalidConfig(format!(
                "listen_addr {:?}: {e}",
                self.node.listen_addr
            ))
        })
    }

    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            attempts: self.connect.attempts,
            retry_delay: Duration::from_millis(self.connect.retry_delay_ms),
        }
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.dispatch.idle_wait_ms)
    }
}
