//! Mesh configuration
//!
//! Loaded once at startup from JSON. Peer descriptors are immutable for the
//! lifetime of the process; changing the mesh requires a restart.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use parkmesh_transport::TransportConfig;

use crate::backfill::WatermarkPolicy;
use crate::error::{NodeError, NodeResult};

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_backoff_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_event_channel_capacity() -> usize {
    1024
}

/// This node's identity and listen address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNode {
    #[serde(alias = "id")]
    pub node_id: String,
    #[serde(default = "default_listen_host", alias = "ip")]
    pub listen_host: String,
    #[serde(alias = "p2p_port")]
    pub listen_port: u16,
}

impl LocalNode {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

/// One remote node this node dials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    #[serde(alias = "id")]
    pub node_id: String,
    #[serde(alias = "ip")]
    pub host: String,
    #[serde(alias = "p2p_port")]
    pub port: u16,
}

impl PeerDescriptor {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for a [`NodeCoordinator`](crate::NodeCoordinator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(alias = "this_central")]
    pub this_node: LocalNode,

    /// Every other node in the mesh. Empty means standalone.
    #[serde(default, alias = "peer_centrals")]
    pub peers: Vec<PeerDescriptor>,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub watermark_policy: WatermarkPolicy,

    /// Hold EXITs that arrive before their ENTRY instead of dropping them
    #[serde(default)]
    pub buffer_orphan_exits: bool,

    /// Capacity of the link event channel feeding dispatch
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl MeshConfig {
    /// Standalone configuration listening on `listen_host:listen_port`
    pub fn new(node_id: impl Into<String>, listen_host: impl Into<String>, listen_port: u16) -> Self {
        Self {
            this_node: LocalNode {
                node_id: node_id.into(),
                listen_host: listen_host.into(),
                listen_port,
            },
            peers: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            watermark_policy: WatermarkPolicy::default(),
            buffer_orphan_exits: false,
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> NodeResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_peer(mut self, peer: PeerDescriptor) -> Self {
        self.peers.push(peer);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_watermark_policy(mut self, policy: WatermarkPolicy) -> Self {
        self.watermark_policy = policy;
        self
    }

    pub fn with_orphan_exit_buffering(mut self, enabled: bool) -> Self {
        self.buffer_orphan_exits = enabled;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.this_node.node_id
    }

    pub fn is_standalone(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::default()
            .with_reconnect_backoff(Duration::from_millis(self.reconnect_backoff_ms))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
    }

    /// Reject configurations the mesh cannot run with
    pub fn validate(&self) -> NodeResult<()> {
        let this_id = self.this_node.node_id.trim();
        if this_id.is_empty() {
            return Err(NodeError::Config("this_node.node_id is empty".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(NodeError::Config("heartbeat_interval_ms must be positive".to_string()));
        }
        if self.reconnect_backoff_ms == 0 {
            return Err(NodeError::Config("reconnect_backoff_ms must be positive".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(NodeError::Config("connect_timeout_ms must be positive".to_string()));
        }
        if self.event_channel_capacity == 0 {
            return Err(NodeError::Config("event_channel_capacity must be positive".to_string()));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id.trim().is_empty() {
                return Err(NodeError::Config(format!("peer at {} has an empty node_id", peer.addr())));
            }
            if peer.node_id == self.this_node.node_id {
                return Err(NodeError::Config(format!(
                    "peer {} has the same id as this node",
                    peer.node_id
                )));
            }
            if !seen.insert(peer.node_id.as_str()) {
                return Err(NodeError::Config(format!("duplicate peer {}", peer.node_id)));
            }
        }
        Ok(())
    }
}
