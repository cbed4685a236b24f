//! Per-peer client pool.
//!
//! One [`PeerClient`] per configured node, built up front and immutable
//! afterwards. Clients dial lazily, so constructing the pool is free and a
//! node can come up before any of its peers exist. The pool also carries a
//! client for this node's own address: with `disable_local_lookup` the
//! coordinator dials itself like any other peer.

use super::PeerClient;
use crate::config::CacheConfig;
use crate::error::{MeshError, Result};
use crate::types::PeerAddr;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Immutable map of peer address to client.
pub struct PeerClientPool {
    clients: HashMap<PeerAddr, Arc<PeerClient>>,
    heartbeat_timeout: Duration,
}

impl PeerClientPool {
    /// Build clients for every node in the config, including self.
    pub fn new(config: &CacheConfig) -> Self {
        let clients = config
            .nodes
            .iter()
            .map(|node| {
                let client = PeerClient::new(
                    node.clone(),
                    config.connect_timeout,
                    config.rpc_timeout,
                    config.peer_concurrency_limit,
                );
                (node.clone(), Arc::new(client))
            })
            .collect();

        Self {
            clients,
            heartbeat_timeout: config.connect_timeout,
        }
    }

    /// The client for `peer`. Unknown addresses are a programming error:
    /// placement only ever yields configured nodes.
    pub fn client(&self, peer: &PeerAddr) -> Result<Arc<PeerClient>> {
        self.clients
            .get(peer)
            .cloned()
            .ok_or_else(|| MeshError::Internal(format!("no client for peer {}", peer)))
    }

    /// Probe one peer's readiness endpoint.
    pub async fn heartbeat(&self, peer: &PeerAddr) -> Result<()> {
        self.client(peer)?.heartbeat(self.heartbeat_timeout).await
    }
}
