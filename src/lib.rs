//! meshcache - a distributed content-addressable cache layer.
//!
//! meshcache federates a set of peer nodes into a single logical cache.
//! Each node wraps a local backing blob store and cooperates with its
//! peers to provide replicated writes, reads with automatic backfill
//! repair, membership-aware routing that survives node failure and
//! restart, and batched multi-key existence and fetch operations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        meshcache node                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Coordinator: write fan-out | read fallback | backfill      │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  Placement: rendezvous hash  │  Membership: heartbeats      │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  Peer RPC: axum handlers (in) | client pool (out)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backing cache: local blob store behind the BlobCache trait │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The coordinator implements the same [`BlobCache`] contract as the
//! backing store, so replacing a local cache with a replicated one is a
//! drop-in change. Placement is deterministic and liveness-free: every
//! node computes the identical replica set for a digest, and a flapping
//! peer never remaps keys. Consistency is best-effort: a write succeeds
//! only when every one of its R replicas acknowledged it, and the read
//! path repairs missing copies opportunistically.
//!
//! # Quick Start
//!
//! ```no_run
//! use meshcache::backing::MemoryCache;
//! use meshcache::config::CacheConfig;
//! use meshcache::coordinator::DistributedCache;
//! use meshcache::types::{Digest, RequestContext};
//! use meshcache::BlobCache;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> meshcache::Result<()> {
//!     let config = CacheConfig::new(
//!         "127.0.0.1:2020",
//!         vec!["127.0.0.1:2020".into(), "127.0.0.1:2021".into()],
//!         2,
//!     );
//!     let node = DistributedCache::new(config, Arc::new(MemoryCache::new(64 << 20)))?;
//!     node.start_listening().await?;
//!
//!     let ctx = RequestContext::with_identity("example");
//!     let data = bytes::Bytes::from_static(b"hello");
//!     let digest = Digest::compute(&data);
//!     node.write(&ctx, &digest, data).await?;
//!
//!     node.shutdown(&RequestContext::anonymous()).await
//! }
//! ```

pub mod backing;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod observability;
pub mod rpc;
pub mod types;

// Re-exports
pub use backing::{BlobCache, BlobReader, MemoryCache};
pub use config::CacheConfig;
pub use coordinator::{DistributedCache, LifecycleState};
pub use error::{MeshError, Result};
pub use types::{Digest, RequestContext};

use std::sync::Arc;
use tracing::info;

/// Run a memory-backed cache node until the process is signalled.
///
/// Applications embedding meshcache construct [`DistributedCache`] over
/// their own backing store instead; this is the standalone-node entry
/// point.
pub async fn run(config: CacheConfig, backing_capacity: u64) -> Result<()> {
    observability::init(&config.observability)?;

    if config.observability.metrics_enabled {
        let obs = config.observability.clone();
        tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    let node = DistributedCache::new(config, Arc::new(MemoryCache::new(backing_capacity)))?;
    node.start_listening().await?;

    wait_for_signal().await;
    info!("shutting down meshcache node");

    let ctx = RequestContext::anonymous().with_timeout(std::time::Duration::from_secs(30));
    node.shutdown(&ctx).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl+C");
}
