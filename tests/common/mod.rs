//! Common test utilities for integration tests.

use bytes::Bytes;
use meshcache::backing::{BlobCache, MemoryCache};
use meshcache::config::CacheConfig;
use meshcache::coordinator::DistributedCache;
use meshcache::types::{Digest, RequestContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Byte budget of each node's backing store in tests.
pub const CACHE_CAPACITY: u64 = 1_000_000;

/// Find an available port for testing.
pub fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind to port");
    listener.local_addr().unwrap().port()
}

/// Addresses for a test cluster of `count` nodes.
pub fn cluster_addrs(count: usize) -> Vec<String> {
    (0..count)
        .map(|_| format!("127.0.0.1:{}", find_available_port()))
        .collect()
}

/// Deterministic random digest/payload generator for reproducible tests.
pub struct TestDataGenerator {
    rng: StdRng,
}

impl TestDataGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A random payload of `len` bytes and its digest.
    pub fn random_blob(&mut self, len: usize) -> (Digest, Bytes) {
        let mut data = vec![0u8; len];
        self.rng.fill(&mut data[..]);
        let data = Bytes::from(data);
        (Digest::compute(&data), data)
    }
}

impl Default for TestDataGenerator {
    fn default() -> Self {
        Self::new(42)
    }
}

/// One node of a test cluster: its coordinator plus direct access to the
/// backing store underneath it.
pub struct TestNode {
    pub addr: String,
    pub cache: Arc<DistributedCache>,
    pub backing: Arc<MemoryCache>,
}

/// A running cluster of coordinators over in-memory backing caches, all
/// configured with `disable_local_lookup` so every operation exercises
/// the peer RPC path.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `node_count` nodes with the given replication factor.
    pub async fn start(node_count: usize, replication_factor: usize) -> Self {
        Self::start_with(node_count, replication_factor, |config| config).await
    }

    /// Start a cluster after applying `adjust` to each node's config.
    pub async fn start_with(
        node_count: usize,
        replication_factor: usize,
        adjust: impl Fn(CacheConfig) -> CacheConfig,
    ) -> Self {
        let addrs = cluster_addrs(node_count);

        let mut nodes = Vec::with_capacity(node_count);
        for addr in &addrs {
            let mut config = CacheConfig::new(addr.clone(), addrs.clone(), replication_factor);
            config.disable_local_lookup = true;
            config.rpc_heartbeat_interval = Duration::from_millis(100);
            let config = adjust(config);

            let backing = Arc::new(MemoryCache::new(CACHE_CAPACITY));
            let cache = Arc::new(
                DistributedCache::new(config, backing.clone() as Arc<dyn BlobCache>)
                    .expect("valid test config"),
            );
            cache.start_listening().await.expect("node starts");

            nodes.push(TestNode {
                addr: addr.clone(),
                cache,
                backing,
            });
        }

        for node in &nodes {
            wait_for_ready(&node.addr).await;
        }

        // Let every node's liveness map converge on the full cluster.
        settle(2).await;

        Self { nodes }
    }

    /// The coordinators, in node order.
    pub fn caches(&self) -> Vec<Arc<DistributedCache>> {
        self.nodes.iter().map(|n| n.cache.clone()).collect()
    }

    /// The backing stores, in node order.
    pub fn backings(&self) -> Vec<Arc<MemoryCache>> {
        self.nodes.iter().map(|n| n.backing.clone()).collect()
    }

    /// Shut down every node.
    pub async fn shutdown(&self) {
        let ctx = RequestContext::anonymous().with_timeout(Duration::from_secs(2));
        for node in &self.nodes {
            let _ = node.cache.shutdown(&ctx).await;
        }
    }
}

/// Poll a node's health endpoint until it answers ready.
pub async fn wait_for_ready(addr: &str) {
    let client = reqwest::Client::new();
    let deadline = Instant::now() + Duration::from_secs(3);

    loop {
        if let Ok(response) = client.get(format!("http://{}/health", addr)).send().await {
            if response.status().is_success() {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "node {} did not become ready",
            addr
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait for the heartbeat loops to converge on current cluster liveness.
pub async fn settle(heartbeats: u32) {
    tokio::time::sleep(Duration::from_millis(100 * heartbeats as u64 + 50)).await;
}

/// Assert that `check` becomes true within `timeout`. Used for the
/// asynchronous backfill properties, which are eventually consistent by
/// design.
pub async fn assert_eventually<F, Fut>(timeout: Duration, what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Read a digest through `cache` and assert the bytes match the digest.
pub async fn read_and_verify(cache: &dyn BlobCache, ctx: &RequestContext, digest: &Digest) {
    let data = cache
        .get(ctx, digest)
        .await
        .unwrap_or_else(|e| panic!("reading {} failed: {}", digest, e));
    assert_eq!(
        Digest::compute(&data),
        *digest,
        "payload does not match digest {}",
        digest
    );
    assert_eq!(data.len() as u64, digest.size_bytes());
}

/// Anonymous context used by most test operations.
pub fn anon_ctx() -> RequestContext {
    RequestContext::with_identity("test-user")
}
