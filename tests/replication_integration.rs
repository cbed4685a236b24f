//! End-to-end replication scenarios over real clusters of nodes talking
//! HTTP to each other, each coordinator running with local lookup
//! disabled so every byte crosses the RPC path.

mod common;

use common::*;
use meshcache::backing::BlobCache;
use meshcache::error::MeshError;
use meshcache::types::{Digest, RequestContext};
use std::time::Duration;

const BLOB_SIZE: usize = 100;
const BLOB_COUNT: usize = 100;

/// 3 nodes, R = 3: every write lands in every backing cache.
#[tokio::test(flavor = "multi_thread")]
async fn test_basic_read_write() {
    let cluster = TestCluster::start(3, 3).await;
    let ctx = anon_ctx();
    let mut gen = TestDataGenerator::default();

    let caches = cluster.caches();
    let backings = cluster.backings();

    for i in 0..BLOB_COUNT {
        let (digest, data) = gen.random_blob(BLOB_SIZE);
        caches[i % 3]
            .write(&ctx, &digest, data.clone())
            .await
            .expect("replicated write");

        for backing in &backings {
            assert!(
                backing.contains(&ctx, &digest).await.unwrap(),
                "backing cache missing {} right after write",
                digest
            );
            read_and_verify(backing.as_ref(), &ctx, &digest).await;
        }
    }

    cluster.shutdown().await;
}

/// 4 nodes, R = 3, one node failed: writes hand off to the survivors and
/// every digest is fully replicated across the three live backings.
#[tokio::test(flavor = "multi_thread")]
async fn test_read_write_with_failed_node() {
    let cluster = TestCluster::start(4, 3).await;
    let ctx = anon_ctx();
    let mut gen = TestDataGenerator::new(7);

    // Fail a node by shutting it down. The running nodes still carry it
    // in their configured node lists.
    let shutdown_ctx = RequestContext::anonymous().with_timeout(Duration::from_millis(100));
    cluster.nodes[2].cache.shutdown(&shutdown_ctx).await.unwrap();

    let survivors = [&cluster.nodes[0], &cluster.nodes[1], &cluster.nodes[3]];

    for i in 0..BLOB_COUNT {
        let (digest, data) = gen.random_blob(BLOB_SIZE);
        survivors[i % survivors.len()]
            .cache
            .write(&ctx, &digest, data.clone())
            .await
            .expect("write with one node down");

        for node in &survivors {
            assert!(
                node.backing.contains(&ctx, &digest).await.unwrap(),
                "surviving backing {} missing {}",
                node.addr,
                digest
            );
            read_and_verify(node.backing.as_ref(), &ctx, &digest).await;
        }
    }

    cluster.shutdown().await;
}

/// 4 nodes, R = 3, one node failed and later restarted: every digest
/// written while it was down is readable through every coordinator,
/// including the restarted one.
#[tokio::test(flavor = "multi_thread")]
async fn test_read_write_with_failed_and_restored_node() {
    let cluster = TestCluster::start(4, 3).await;
    let ctx = anon_ctx();
    let mut gen = TestDataGenerator::new(11);

    let shutdown_ctx = RequestContext::anonymous().with_timeout(Duration::from_millis(100));
    cluster.nodes[2].cache.shutdown(&shutdown_ctx).await.unwrap();

    let survivors = [&cluster.nodes[0], &cluster.nodes[1], &cluster.nodes[3]];
    let mut written = Vec::with_capacity(BLOB_COUNT);

    for i in 0..BLOB_COUNT {
        let (digest, data) = gen.random_blob(BLOB_SIZE);
        survivors[i % survivors.len()]
            .cache
            .write(&ctx, &digest, data.clone())
            .await
            .expect("write with one node down");
        written.push(digest);
    }

    // Restore the failed node and let heartbeats converge.
    cluster.nodes[2].cache.start_listening().await.unwrap();
    wait_for_ready(&cluster.nodes[2].addr).await;
    settle(3).await;

    for digest in &written {
        for node in &cluster.nodes {
            assert!(
                node.cache.contains(&ctx, digest).await.unwrap(),
                "digest {} not visible via {}",
                digest,
                node.addr
            );
            read_and_verify(node.cache.as_ref(), &ctx, digest).await;
        }
    }

    cluster.shutdown().await;
}

/// 3 nodes, R = 3: zero out one backing cache, then read everything back
/// through the coordinators. Every read succeeds and the zeroed cache is
/// repopulated by backfill.
#[tokio::test(flavor = "multi_thread")]
async fn test_backfill() {
    let cluster = TestCluster::start(3, 3).await;
    let ctx = anon_ctx();
    let mut gen = TestDataGenerator::new(13);

    let caches = cluster.caches();
    let backings = cluster.backings();
    let mut written = Vec::with_capacity(BLOB_COUNT);

    for i in 0..BLOB_COUNT {
        let (digest, data) = gen.random_blob(BLOB_SIZE);
        caches[i % 3].write(&ctx, &digest, data).await.unwrap();
        written.push(digest);
    }

    // Zero out one of the base caches.
    for digest in &written {
        backings[2].delete(&ctx, digest).await.unwrap();
        assert!(!backings[2].contains(&ctx, digest).await.unwrap());
    }

    for digest in &written {
        for cache in &caches {
            assert!(cache.contains(&ctx, digest).await.unwrap());
            read_and_verify(cache.as_ref(), &ctx, digest).await;
        }

        // Backfill is fire-and-forget; the repair lands shortly after
        // the reads complete.
        let backing = backings[2].clone();
        let digest = digest.clone();
        assert_eventually(Duration::from_secs(3), "backfill to the zeroed cache", {
            let ctx = ctx.clone();
            move || {
                let backing = backing.clone();
                let digest = digest.clone();
                let ctx = ctx.clone();
                async move { backing.contains(&ctx, &digest).await.unwrap_or(false) }
            }
        })
        .await;
    }

    // Once repaired, the bytes themselves must verify.
    for digest in &written {
        read_and_verify(backings[2].as_ref(), &ctx, digest).await;
    }

    cluster.shutdown().await;
}

/// Batched existence checks cover every written digest from every
/// coordinator and every backing cache.
#[tokio::test(flavor = "multi_thread")]
async fn test_contains_multi() {
    let cluster = TestCluster::start(3, 3).await;
    let ctx = anon_ctx();
    let mut gen = TestDataGenerator::new(17);

    let caches = cluster.caches();
    let mut written = Vec::with_capacity(BLOB_COUNT);

    for i in 0..BLOB_COUNT {
        let (digest, data) = gen.random_blob(BLOB_SIZE);
        caches[i % 3].write(&ctx, &digest, data).await.unwrap();
        written.push(digest);
    }

    for backing in cluster.backings() {
        let found = backing.contains_multi(&ctx, &written).await.unwrap();
        for digest in &written {
            assert_eq!(found.get(digest), Some(&true), "backing missing {}", digest);
        }
    }

    for cache in &caches {
        let found = cache.contains_multi(&ctx, &written).await.unwrap();
        assert_eq!(found.len(), written.len());
        for digest in &written {
            assert_eq!(
                found.get(digest),
                Some(&true),
                "coordinator missing {}",
                digest
            );
        }
    }

    cluster.shutdown().await;
}

/// Batched fetches return every written payload with its declared size,
/// from every coordinator and every backing cache.
#[tokio::test(flavor = "multi_thread")]
async fn test_get_multi() {
    let cluster = TestCluster::start(3, 3).await;
    let ctx = anon_ctx();
    let mut gen = TestDataGenerator::new(19);

    let caches = cluster.caches();
    let mut written = Vec::with_capacity(BLOB_COUNT);

    for i in 0..BLOB_COUNT {
        let (digest, data) = gen.random_blob(BLOB_SIZE);
        caches[i % 3].write(&ctx, &digest, data).await.unwrap();
        written.push(digest);
    }

    for backing in cluster.backings() {
        let blobs = backing.get_multi(&ctx, &written).await.unwrap();
        for digest in &written {
            let data = blobs.get(digest).expect("payload present");
            assert_eq!(data.len() as u64, digest.size_bytes());
        }
    }

    for cache in &caches {
        let blobs = cache.get_multi(&ctx, &written).await.unwrap();
        assert_eq!(blobs.len(), written.len());
        for digest in &written {
            let data = blobs.get(digest).expect("payload present");
            assert_eq!(data.len() as u64, digest.size_bytes());
            assert_eq!(&Digest::compute(data), digest);
        }
    }

    cluster.shutdown().await;
}

/// Unknown digests are absent from batched fetches and false in batched
/// existence checks, while known digests still resolve.
#[tokio::test(flavor = "multi_thread")]
async fn test_multi_ops_with_missing_digests() {
    let cluster = TestCluster::start(3, 2).await;
    let ctx = anon_ctx();
    let mut gen = TestDataGenerator::new(23);

    let caches = cluster.caches();
    let (present, data) = gen.random_blob(BLOB_SIZE);
    let (absent, _) = gen.random_blob(BLOB_SIZE);
    caches[0].write(&ctx, &present, data.clone()).await.unwrap();

    let cache = &caches[1];
    let query = vec![present.clone(), absent.clone()];

    let found = cache.contains_multi(&ctx, &query).await.unwrap();
    assert_eq!(found.get(&present), Some(&true));
    assert_eq!(found.get(&absent), Some(&false));

    let blobs = cache.get_multi(&ctx, &query).await.unwrap();
    assert_eq!(blobs.get(&present), Some(&data));
    assert!(!blobs.contains_key(&absent));

    let err = cache.get(&ctx, &absent).await.unwrap_err();
    assert!(err.is_not_found());

    cluster.shutdown().await;
}

/// With R equal to the cluster size, losing a node makes the durability
/// target unreachable: the write must fail rather than under-replicate.
#[tokio::test(flavor = "multi_thread")]
async fn test_write_fails_below_replication_target() {
    let cluster = TestCluster::start(3, 3).await;
    let ctx = anon_ctx();
    let mut gen = TestDataGenerator::new(29);

    let shutdown_ctx = RequestContext::anonymous().with_timeout(Duration::from_millis(100));
    cluster.nodes[2].cache.shutdown(&shutdown_ctx).await.unwrap();
    settle(3).await;

    let (digest, data) = gen.random_blob(BLOB_SIZE);
    let err = cluster.nodes[0]
        .cache
        .write(&ctx, &digest, data)
        .await
        .unwrap_err();
    assert!(
        matches!(err, MeshError::WriteFailed { .. }),
        "expected a peer-tagged write failure, got {}",
        err
    );

    cluster.shutdown().await;
}

/// Deleting through one coordinator removes the digest from every live
/// replica.
#[tokio::test(flavor = "multi_thread")]
async fn test_replicated_delete() {
    let cluster = TestCluster::start(3, 3).await;
    let ctx = anon_ctx();
    let mut gen = TestDataGenerator::new(31);

    let (digest, data) = gen.random_blob(BLOB_SIZE);
    cluster.caches()[0].write(&ctx, &digest, data).await.unwrap();

    for backing in cluster.backings() {
        assert!(backing.contains(&ctx, &digest).await.unwrap());
    }

    cluster.caches()[1].delete(&ctx, &digest).await.unwrap();

    for backing in cluster.backings() {
        assert!(!backing.contains(&ctx, &digest).await.unwrap());
    }
    assert!(!cluster.caches()[2].contains(&ctx, &digest).await.unwrap());

    cluster.shutdown().await;
}

/// A request context that has already expired is rejected without
/// touching any peer.
#[tokio::test(flavor = "multi_thread")]
async fn test_expired_deadline_is_surfaced() {
    let cluster = TestCluster::start(2, 2).await;
    let mut gen = TestDataGenerator::new(37);

    let (digest, data) = gen.random_blob(BLOB_SIZE);
    let expired = RequestContext::anonymous().with_timeout(Duration::ZERO);

    let err = cluster.caches()[0]
        .write(&expired, &digest, data)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::DeadlineExceeded));

    cluster.shutdown().await;
}
