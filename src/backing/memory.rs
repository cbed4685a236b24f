//! In-memory backing cache.
//!
//! An LRU blob store with a byte-size budget. This is the default local
//! store for small deployments and the backing cache used throughout the
//! integration tests; production nodes typically wrap a disk-backed store
//! behind the same [`BlobCache`] trait.

use super::{BlobCache, BlobReader};
use crate::error::{MeshError, Result};
use crate::types::{Digest, RequestContext};
use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters exposed by [`MemoryCache::stats`].
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub size_bytes: u64,
}

struct Inner {
    entries: LruCache<String, Bytes>,
    used_bytes: u64,
}

/// Byte-budgeted LRU blob store.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_size_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    /// Create a store holding at most `max_size_bytes` of blob data.
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used_bytes: 0,
            }),
            max_size_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> MemoryCacheStats {
        let inner = self.inner.lock();
        MemoryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            size_bytes: inner.used_bytes,
        }
    }

    fn lookup(&self, digest: &Digest) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        match inner.entries.get(digest.hash()) {
            Some(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(data.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

#[async_trait]
impl BlobCache for MemoryCache {
    async fn read(
        &self,
        _ctx: &RequestContext,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobReader> {
        let data = self
            .lookup(digest)
            .ok_or_else(|| MeshError::NotFound(digest.to_string()))?;

        if offset > data.len() as u64 {
            return Err(MeshError::Storage(format!(
                "offset {} beyond blob size {} for {}",
                offset,
                data.len(),
                digest
            )));
        }

        let reader: BlobReader = Box::new(Cursor::new(data.slice(offset as usize..)));
        Ok(reader)
    }

    async fn write(&self, _ctx: &RequestContext, digest: &Digest, data: Bytes) -> Result<()> {
        let size = data.len() as u64;
        if size > self.max_size_bytes {
            return Err(MeshError::Storage(format!(
                "blob {} ({} bytes) exceeds cache capacity {}",
                digest, size, self.max_size_bytes
            )));
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(digest.hash()) {
            inner.used_bytes -= old.len() as u64;
        }

        while inner.used_bytes + size > self.max_size_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.used_bytes -= evicted.len() as u64;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        inner.entries.put(digest.hash().to_string(), data);
        inner.used_bytes += size;
        Ok(())
    }

    async fn contains(&self, _ctx: &RequestContext, digest: &Digest) -> Result<bool> {
        // Existence checks do not promote: peek instead of get.
        let inner = self.inner.lock();
        Ok(inner.entries.peek(digest.hash()).is_some())
    }

    async fn contains_multi(
        &self,
        ctx: &RequestContext,
        digests: &[Digest],
    ) -> Result<HashMap<Digest, bool>> {
        let mut found = HashMap::with_capacity(digests.len());
        for digest in digests {
            let present = self.contains(ctx, digest).await?;
            found.insert(digest.clone(), present);
        }
        Ok(found)
    }

    async fn get_multi(
        &self,
        _ctx: &RequestContext,
        digests: &[Digest],
    ) -> Result<HashMap<Digest, Bytes>> {
        let mut blobs = HashMap::new();
        for digest in digests {
            if let Some(data) = self.lookup(digest) {
                blobs.insert(digest.clone(), data);
            }
        }
        Ok(blobs)
    }

    async fn delete(&self, _ctx: &RequestContext, digest: &Digest) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(digest.hash()) {
            inner.used_bytes -= old.len() as u64;
        }
        Ok(())
    }
}
