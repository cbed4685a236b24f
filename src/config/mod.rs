//! Configuration module for meshcache.

use crate::error::{MeshError, Result};
use crate::types::PeerAddr;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration for one cache node.
///
/// Supplied once at construction and never reloaded. `nodes` is the full
/// static peer list including this node's own `listen_addr`; membership
/// changes flip liveness, never the list itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// This node's advertised address. Must be an element of `nodes`.
    pub listen_addr: PeerAddr,
    /// Ordered list of all peer addresses, including self.
    pub nodes: Vec<PeerAddr>,
    /// How many peers every digest is replicated to. 1 ≤ R ≤ nodes.len().
    pub replication_factor: usize,
    /// Never short-circuit through the local adapter: every operation
    /// goes through the replica set as if local were just another peer.
    /// Testing affordance for replication parity.
    #[serde(default)]
    pub disable_local_lookup: bool,
    /// Period between liveness probes.
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub rpc_heartbeat_interval: Duration,
    /// Pool-level per-call timeout for peer RPCs.
    #[serde(with = "humantime_serde", default = "default_rpc_timeout")]
    pub rpc_timeout: Duration,
    /// Dial timeout for peer connections.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Per-peer bound on concurrent in-flight RPCs.
    #[serde(default = "default_peer_concurrency")]
    pub peer_concurrency_limit: usize,
    /// Global bound on concurrent backfill writes.
    #[serde(default = "default_backfill_concurrency")]
    pub backfill_concurrency: usize,
    /// Logging and metrics settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_peer_concurrency() -> usize {
    64
}

fn default_backfill_concurrency() -> usize {
    16
}

impl CacheConfig {
    /// Minimal config for a cluster given its node list and this node's
    /// own address. Remaining fields take defaults.
    pub fn new(
        listen_addr: impl Into<PeerAddr>,
        nodes: Vec<PeerAddr>,
        replication_factor: usize,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            nodes,
            replication_factor,
            disable_local_lookup: false,
            rpc_heartbeat_interval: default_heartbeat_interval(),
            rpc_timeout: default_rpc_timeout(),
            connect_timeout: default_connect_timeout(),
            peer_concurrency_limit: default_peer_concurrency(),
            backfill_concurrency: default_backfill_concurrency(),
            observability: ObservabilityConfig::default(),
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| MeshError::InvalidConfig {
            field: "config".to_string(),
            reason: format!("failed to read config file: {}", e),
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| MeshError::InvalidConfig {
            field: "config".to_string(),
            reason: format!("failed to parse config: {}", e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Called at coordinator construction.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(MeshError::InvalidConfig {
                field: "nodes".to_string(),
                reason: "node list must not be empty".to_string(),
            });
        }

        let unique: HashSet<&PeerAddr> = self.nodes.iter().collect();
        if unique.len() != self.nodes.len() {
            return Err(MeshError::InvalidConfig {
                field: "nodes".to_string(),
                reason: "node list contains duplicate addresses".to_string(),
            });
        }

        if !self.nodes.contains(&self.listen_addr) {
            return Err(MeshError::InvalidConfig {
                field: "listen_addr".to_string(),
                reason: format!("{} is not an element of nodes", self.listen_addr),
            });
        }

        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(MeshError::InvalidConfig {
                field: "listen_addr".to_string(),
                reason: format!("{} is not a valid socket address", self.listen_addr),
            });
        }

        if self.replication_factor == 0 {
            return Err(MeshError::InvalidConfig {
                field: "replication_factor".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if self.replication_factor > self.nodes.len() {
            return Err(MeshError::InvalidConfig {
                field: "replication_factor".to_string(),
                reason: format!(
                    "replication factor {} exceeds cluster size {}",
                    self.replication_factor,
                    self.nodes.len()
                ),
            });
        }

        if self.peer_concurrency_limit == 0 {
            return Err(MeshError::InvalidConfig {
                field: "peer_concurrency_limit".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if self.backfill_concurrency == 0 {
            return Err(MeshError::InvalidConfig {
                field: "backfill_concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Peers other than this node, in configured order.
    pub fn remote_nodes(&self) -> impl Iterator<Item = &PeerAddr> {
        self.nodes.iter().filter(move |n| **n != self.listen_addr)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter (overridden by `RUST_LOG` when set).
    pub log_level: String,
    /// Emit logs as JSON.
    pub json_logs: bool,
    /// Serve Prometheus metrics.
    pub metrics_enabled: bool,
    /// Address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_addr: "127.0.0.1:9464".parse().expect("valid socket address"),
        }
    }
}
