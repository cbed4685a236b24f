//! Read-repair backfill.
//!
//! When a read is served by a replica other than the primary, or any live
//! replica is observed missing the digest, the coordinator repairs the gap
//! by rewriting the blob to the lagging replicas. Backfill is
//! fire-and-forget: the read reply is never blocked, failures are logged
//! rather than reported, at most one repair per (digest, target) is in
//! flight at a time, and a global concurrency bound keeps mass repair from
//! starving foreground traffic. Tasks are detached from the reading
//! caller's deadline but drain on node shutdown.

use crate::backing::{BlobCache, BlobReader};
use crate::error::{MeshError, Result};
use crate::types::{Digest, PeerAddr, RequestContext};
use bytes::Bytes;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Budget for one repair write, independent of the reading caller.
const BACKFILL_TIMEOUT: Duration = Duration::from_secs(30);

/// One replica to repair.
pub(crate) struct BackfillTarget {
    pub peer: PeerAddr,
    pub handle: Arc<dyn BlobCache>,
    /// The read walk already saw this replica answer NotFound, so the
    /// existence probe can be skipped.
    pub known_missing: bool,
}

/// Bounded, deduplicated scheduler for repair writes.
pub(crate) struct Backfiller {
    limiter: Arc<Semaphore>,
    inflight: Arc<Mutex<HashSet<(String, PeerAddr)>>>,
    tracker: TaskTracker,
    cancel: RwLock<CancellationToken>,
}

impl Backfiller {
    pub fn new(concurrency: usize) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(concurrency)),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Accept new work again after a shutdown/restart cycle.
    pub fn reopen(&self) {
        self.tracker.reopen();
        *self.cancel.write() = CancellationToken::new();
    }

    /// Queue repairs of `digest` to `targets`. Returns immediately.
    pub fn schedule(
        &self,
        identity: Option<String>,
        digest: &Digest,
        data: Bytes,
        targets: Vec<BackfillTarget>,
    ) {
        for target in targets {
            let key = (digest.hash().to_string(), target.peer.clone());
            if !self.inflight.lock().insert(key.clone()) {
                debug!(digest = %digest, peer = %target.peer, "backfill already in flight");
                continue;
            }

            let limiter = Arc::clone(&self.limiter);
            let inflight = Arc::clone(&self.inflight);
            let token = self.cancel.read().clone();
            let digest = digest.clone();
            let data = data.clone();
            let identity = identity.clone();

            self.tracker.spawn(async move {
                let outcome = tokio::select! {
                    _ = token.cancelled() => Ok(false),
                    res = Self::repair(&limiter, identity, &digest, data, &target) => res,
                };

                match outcome {
                    Ok(true) => {
                        counter!("meshcache_backfills_total").increment(1);
                        debug!(digest = %digest, peer = %target.peer, "backfilled replica");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        counter!("meshcache_backfill_failures_total").increment(1);
                        warn!(digest = %digest, peer = %target.peer, error = %e, "backfill failed");
                    }
                }

                inflight.lock().remove(&key);
            });
        }
    }

    /// Whether a repair wrote anything.
    async fn repair(
        limiter: &Semaphore,
        identity: Option<String>,
        digest: &Digest,
        data: Bytes,
        target: &BackfillTarget,
    ) -> Result<bool> {
        let _permit = limiter
            .acquire()
            .await
            .map_err(|_| MeshError::ShuttingDown)?;

        let ctx = match identity {
            Some(identity) => RequestContext::with_identity(identity),
            None => RequestContext::anonymous(),
        }
        .with_timeout(BACKFILL_TIMEOUT);

        if !target.known_missing && target.handle.contains(&ctx, digest).await? {
            return Ok(false);
        }

        target.handle.write(&ctx, digest, data).await?;
        Ok(true)
    }

    /// Stop accepting implicit continuations and wait for in-flight
    /// repairs up to `deadline`; whatever remains is cancelled.
    pub async fn drain(&self, deadline: Duration) {
        self.tracker.close();
        let _ = tokio::time::timeout(deadline, self.tracker.wait()).await;
        self.cancel.read().cancel();
    }
}

/// Tee over a streamed read: buffers the bytes that pass through and, once
/// the stream ends with the full blob captured, hands them to the backfill
/// callback. Dropping the reader early simply skips the repair.
pub(crate) struct CaptureReader {
    inner: BlobReader,
    captured: Vec<u8>,
    expected: usize,
    on_complete: Option<Box<dyn FnOnce(Bytes) + Send>>,
}

impl CaptureReader {
    pub fn new(
        inner: BlobReader,
        expected: usize,
        on_complete: impl FnOnce(Bytes) + Send + 'static,
    ) -> Self {
        Self {
            inner,
            captured: Vec::with_capacity(expected),
            expected,
            on_complete: Some(Box::new(on_complete)),
        }
    }
}

impl AsyncRead for CaptureReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled().len();
                if filled > before {
                    this.captured.extend_from_slice(&buf.filled()[before..filled]);
                } else if buf.remaining() > 0 {
                    // EOF: fire the callback once, and only for a
                    // complete capture.
                    if this.captured.len() == this.expected {
                        if let Some(on_complete) = this.on_complete.take() {
                            on_complete(Bytes::from(std::mem::take(&mut this.captured)));
                        }
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemoryCache;
    use tokio::io::AsyncReadExt;

    fn target(cache: Arc<MemoryCache>, known_missing: bool) -> BackfillTarget {
        BackfillTarget {
            peer: "127.0.0.1:7009".to_string(),
            handle: cache,
            known_missing,
        }
    }

    #[tokio::test]
    async fn test_schedule_repairs_missing_replica() {
        let backfiller = Backfiller::new(4);
        let cache = Arc::new(MemoryCache::new(1024));
        let data = Bytes::from_static(b"repair me");
        let digest = Digest::compute(&data);

        backfiller.schedule(None, &digest, data.clone(), vec![target(cache.clone(), true)]);
        backfiller.drain(Duration::from_secs(2)).await;

        let got = cache
            .get(&RequestContext::anonymous(), &digest)
            .await
            .unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_probe_skips_present_replica() {
        let backfiller = Backfiller::new(4);
        let cache = Arc::new(MemoryCache::new(1024));
        let ctx = RequestContext::anonymous();
        let data = Bytes::from_static(b"already here");
        let digest = Digest::compute(&data);
        cache.write(&ctx, &digest, data.clone()).await.unwrap();

        backfiller.schedule(None, &digest, data, vec![target(cache.clone(), false)]);
        backfiller.drain(Duration::from_secs(2)).await;

        assert!(cache.contains(&ctx, &digest).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_targets_repair_once() {
        let backfiller = Backfiller::new(4);
        let cache = Arc::new(MemoryCache::new(1024));
        let data = Bytes::from_static(b"deduplicated");
        let digest = Digest::compute(&data);

        // Two schedules for the same (digest, peer) while the first may
        // still be in flight: the second is dropped, not queued.
        backfiller.schedule(None, &digest, data.clone(), vec![target(cache.clone(), true)]);
        backfiller.schedule(None, &digest, data.clone(), vec![target(cache.clone(), true)]);
        backfiller.drain(Duration::from_secs(2)).await;

        let got = cache
            .get(&RequestContext::anonymous(), &digest)
            .await
            .unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_capture_reader_fires_on_complete_stream() {
        let data = Bytes::from_static(b"streamed bytes");
        let inner: BlobReader = Box::new(std::io::Cursor::new(data.clone()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut reader = CaptureReader::new(inner, data.len(), move |captured| {
            let _ = tx.send(captured);
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);

        let captured = rx.await.unwrap();
        assert_eq!(captured, data);
    }

    #[tokio::test]
    async fn test_capture_reader_ignores_truncated_stream() {
        let data = Bytes::from_static(b"partial");
        let inner: BlobReader = Box::new(std::io::Cursor::new(data.clone()));

        let (tx, rx) = tokio::sync::oneshot::channel::<Bytes>();
        // Expected size larger than the stream: callback must not fire.
        let mut reader = CaptureReader::new(inner, data.len() + 10, move |captured| {
            let _ = tx.send(captured);
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        drop(reader);
        assert!(rx.await.is_err());
    }
}
