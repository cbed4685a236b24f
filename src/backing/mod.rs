//! The backing cache contract.
//!
//! [`BlobCache`] is the uniform operation set the replication coordinator
//! requires of any blob store: the local adapter, the remote peer client,
//! and the coordinator facade itself all implement it. The coordinator is
//! therefore a drop-in replacement for a local cache, and handles produced
//! by dispatch are interchangeable regardless of where the bytes live.
//!
//! Implementations must be safe for concurrent use from many coordinator
//! tasks.

mod memory;

pub use memory::{MemoryCache, MemoryCacheStats};

use crate::error::Result;
use crate::types::{Digest, RequestContext};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Streamed blob contents.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Uniform cache contract over a byte-addressable blob store keyed by
/// content digest.
#[async_trait]
pub trait BlobCache: Send + Sync {
    /// Open a reader over the blob, starting at `offset`.
    async fn read(&self, ctx: &RequestContext, digest: &Digest, offset: u64)
        -> Result<BlobReader>;

    /// Store a blob under its digest.
    async fn write(&self, ctx: &RequestContext, digest: &Digest, data: Bytes) -> Result<()>;

    /// Whether the store holds the digest.
    async fn contains(&self, ctx: &RequestContext, digest: &Digest) -> Result<bool>;

    /// Batched existence check. Every input digest appears as a key in
    /// the returned map.
    async fn contains_multi(
        &self,
        ctx: &RequestContext,
        digests: &[Digest],
    ) -> Result<HashMap<Digest, bool>>;

    /// Batched fetch. Missing digests are omitted from the returned map.
    async fn get_multi(
        &self,
        ctx: &RequestContext,
        digests: &[Digest],
    ) -> Result<HashMap<Digest, Bytes>>;

    /// Remove a blob. Deleting a missing digest is not an error.
    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()>;

    /// Read a whole blob into memory.
    async fn get(&self, ctx: &RequestContext, digest: &Digest) -> Result<Bytes> {
        let mut reader = self.read(ctx, digest, 0).await?;
        let mut buf = Vec::with_capacity(digest.size_bytes() as usize);
        reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}
