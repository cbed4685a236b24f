//! Deterministic digest-to-replica placement.
//!
//! Placement uses rendezvous (highest-random-weight) hashing over the full
//! configured peer list. Every node computes the identical ordered replica
//! list for a digest, the mapping never consults liveness, and adding or
//! removing one peer remaps only an O(1/n) fraction of keys. Liveness only
//! decides which replicas the coordinator tries first; it never moves keys.

use crate::types::{Digest, PeerAddr};
use sha2::{Digest as _, Sha256};

/// Rendezvous placement over a fixed peer list.
#[derive(Debug, Clone)]
pub struct RendezvousPlacement {
    nodes: Vec<PeerAddr>,
    replication_factor: usize,
}

impl RendezvousPlacement {
    pub fn new(nodes: Vec<PeerAddr>, replication_factor: usize) -> Self {
        Self {
            nodes,
            replication_factor,
        }
    }

    /// The configured replication factor.
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// The full peer list in configured order.
    pub fn nodes(&self) -> &[PeerAddr] {
        &self.nodes
    }

    /// The ordered replica set for a digest: the first R entries of the
    /// full preference list, primary first.
    pub fn replicas(&self, digest: &Digest) -> Vec<PeerAddr> {
        let mut prefs = self.preference_list(digest);
        prefs.truncate(self.replication_factor);
        prefs
    }

    /// The full preference order over every peer, used to walk past the
    /// top-R when replicas are down.
    pub fn preference_list(&self, digest: &Digest) -> Vec<PeerAddr> {
        let mut scored: Vec<(u64, &PeerAddr)> = self
            .nodes
            .iter()
            .map(|node| (score(digest, node), node))
            .collect();

        // Highest score wins; ties broken by peer address so every node
        // derives the same order.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().map(|(_, node)| node.clone()).collect()
    }
}

/// Weight of `node` for `digest`: the first eight bytes of
/// SHA-256(digest-hash "/" node) as a big-endian integer.
fn score(digest: &Digest, node: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(digest.hash().as_bytes());
    hasher.update(b"/");
    hasher.update(node.as_bytes());
    let out = hasher.finalize();
    u64::from_be_bytes(out[..8].try_into().expect("sha256 output is 32 bytes"))
}
