//! Heartbeat-driven liveness tracking.
//!
//! The tracker owns the liveness map over the static peer list. A
//! background task pings every remote peer at the configured interval and
//! records successful probes; liveness is derived from the age of the last
//! success at query time. A peer is down once two intervals pass without a
//! successful heartbeat. The hot path only takes a snapshot read of the
//! map and never awaits the tracker; a stale snapshot is always
//! acceptable.

use crate::rpc::PeerClientPool;
use crate::types::{PeerAddr, PeerHealth, PeerLiveness};
use futures::future::join_all;
use metrics::gauge;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How many heartbeat intervals may elapse before a peer is down.
const DOWN_AFTER_INTERVALS: u32 = 2;

/// Liveness map over the static peer list.
pub struct MembershipTracker {
    self_addr: PeerAddr,
    peers: Vec<PeerAddr>,
    interval: Duration,
    listening: AtomicBool,
    last_success: RwLock<HashMap<PeerAddr, Instant>>,
}

impl MembershipTracker {
    /// Create a tracker for `nodes`, where `self_addr` is this node.
    pub fn new(self_addr: PeerAddr, nodes: Vec<PeerAddr>, interval: Duration) -> Self {
        Self {
            self_addr,
            peers: nodes,
            interval,
            listening: AtomicBool::new(false),
            last_success: RwLock::new(HashMap::new()),
        }
    }

    /// Mark this node listening (self becomes trivially live) or not.
    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    /// Forget all heartbeat history. Called when a node restarts.
    pub fn reset(&self) {
        self.last_success.write().clear();
    }

    /// Record a successful probe of `peer`.
    pub fn record_success(&self, peer: &PeerAddr) {
        self.last_success.write().insert(peer.clone(), Instant::now());
    }

    /// Liveness state of a peer right now.
    pub fn state(&self, peer: &PeerAddr) -> PeerLiveness {
        if *peer == self.self_addr {
            return if self.listening.load(Ordering::SeqCst) {
                PeerLiveness::Live
            } else {
                PeerLiveness::Down
            };
        }

        let last = self.last_success.read().get(peer).copied();
        match last {
            None => PeerLiveness::Down,
            Some(at) => {
                let age = at.elapsed();
                if age < self.interval {
                    PeerLiveness::Live
                } else if age < self.interval * DOWN_AFTER_INTERVALS {
                    PeerLiveness::Suspect
                } else {
                    PeerLiveness::Down
                }
            }
        }
    }

    /// Whether a peer should be routed to.
    pub fn is_live(&self, peer: &PeerAddr) -> bool {
        self.state(peer).is_live()
    }

    /// Number of peers currently considered live, including self.
    pub fn live_count(&self) -> usize {
        self.peers.iter().filter(|p| self.is_live(p)).count()
    }

    /// Snapshot of every peer's health.
    pub fn snapshot(&self) -> HashMap<PeerAddr, PeerHealth> {
        let last = self.last_success.read();
        self.peers
            .iter()
            .map(|peer| {
                (
                    peer.clone(),
                    PeerHealth {
                        state: self.state(peer),
                        last_heartbeat: last.get(peer).copied(),
                    },
                )
            })
            .collect()
    }

    /// Run the heartbeat loop until `shutdown_rx` flips. One probe round
    /// per interval; the first round fires immediately so a freshly
    /// started node converges fast.
    pub async fn run(
        self: Arc<Self>,
        pool: Arc<PeerClientPool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let remote_peers: Vec<PeerAddr> = self
            .peers
            .iter()
            .filter(|p| **p != self.self_addr)
            .cloned()
            .collect();

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(peers = remote_peers.len(), interval = ?self.interval, "membership tracker starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_round(&pool, &remote_peers).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("membership tracker shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn probe_round(&self, pool: &PeerClientPool, peers: &[PeerAddr]) {
        let probes = peers
            .iter()
            .map(|peer| async move { (peer, pool.heartbeat(peer).await) });

        for (peer, result) in join_all(probes).await {
            match result {
                Ok(()) => {
                    let was_down = !self.is_live(peer);
                    self.record_success(peer);
                    if was_down {
                        info!(peer = %peer, "peer became live");
                    }
                }
                Err(e) => {
                    if self.is_live(peer) {
                        warn!(peer = %peer, error = %e, "heartbeat failed");
                    } else {
                        debug!(peer = %peer, error = %e, "peer still down");
                    }
                }
            }
        }

        gauge!("meshcache_peers_live").set(self.live_count() as f64);
    }
}
