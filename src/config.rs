//! Overlay configuration and bootstrap peer list.

use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default UDP discovery port.
pub const DEFAULT_UDP_PORT: u16 = 32768;

/// Default TCP transport port.
pub const DEFAULT_TCP_PORT: u16 = 32768;

/// Embedded fallback bootstrap list, used when no file is configured.
const DEFAULT_BOOTSTRAP: &str = r#"
{
    "nodes": [
        {
            "id": "c4ef0694fee0cdf78eab30c83b325293047e0b27511b92e8e206b199b24f13ea",
            "ip": "101.200.156.243",
            "port": 32768
        }
    ]
}"#;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for one overlay instance.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// UDP discovery port.
    pub udp_port: u16,
    /// TCP transport port.
    pub tcp_port: u16,
    /// Maximum chunk payload size before a message goes multipart.
    pub chunk_size: usize,
    /// Cadence of the liveness ping sweep.
    pub ping_interval: Duration,
    /// Cadence of the neighbor-query sweep.
    pub find_node_interval: Duration,
    /// Delay before the first neighbor-query sweep.
    pub find_node_delay: Duration,
    /// How long a ping/find-node request may stay unanswered.
    pub request_timeout: Duration,
    /// How long a broadcast id suppresses its own loopback.
    pub suppression_window: Duration,
    /// How long an incomplete multipart buffer may sit idle.
    pub reassembly_timeout: Duration,
    /// Bootstrap peer list file; the embedded default applies when unset.
    pub bootstrap_path: Option<PathBuf>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            chunk_size: 4096,
            ping_interval: Duration::from_secs(5),
            find_node_interval: Duration::from_secs(30),
            find_node_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(3),
            suppression_window: Duration::from_secs(60 * 60),
            reassembly_timeout: Duration::from_secs(60),
            bootstrap_path: None,
        }
    }
}

/// One bootstrap peer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapNode {
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
}

/// Seed peers consumed at routing-table construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapList {
    pub nodes: Vec<BootstrapNode>,
}

impl BootstrapList {
    /// Load from `path`, or fall back to the embedded default list.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(serde_json::from_str(DEFAULT_BOOTSTRAP)?),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
