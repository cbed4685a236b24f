//! HTTP client for one peer's inbound cache handlers.
//!
//! [`PeerClient`] implements the same [`BlobCache`] contract as the local
//! adapter, so the coordinator's dispatch treats local and remote handles
//! uniformly. Construction never dials: reqwest connects on first use, so
//! a node can be built before its peers exist.

use super::{
    BlobQuery, ContainsMultiRequest, ContainsMultiResponse, GetMultiRequest, GetMultiResponse,
    DEADLINE_HEADER, IDENTITY_HEADER,
};
use crate::backing::{BlobCache, BlobReader};
use crate::error::{MeshError, Result};
use crate::types::{Digest, PeerAddr, RequestContext};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::io::StreamReader;

/// Client half of the peer RPC surface.
pub struct PeerClient {
    peer: PeerAddr,
    base_url: String,
    client: reqwest::Client,
    rpc_timeout: Duration,
    limiter: Arc<Semaphore>,
}

impl PeerClient {
    /// Build a client for `peer`. No connection is established until the
    /// first call.
    pub fn new(
        peer: PeerAddr,
        connect_timeout: Duration,
        rpc_timeout: Duration,
        concurrency_limit: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: format!("http://{}", peer),
            peer,
            client,
            rpc_timeout,
            limiter: Arc::new(Semaphore::new(concurrency_limit)),
        }
    }

    /// The peer this client talks to.
    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// Probe the peer's readiness endpoint.
    pub async fn heartbeat(&self, timeout: Duration) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(MeshError::unreachable(
                &self.peer,
                format!("not ready: {}", response.status()),
            ))
        }
    }

    /// One RPC slot per call keeps a saturated peer queueing instead of
    /// growing unbounded tasks.
    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MeshError::ShuttingDown)
    }

    fn blob_url(&self, digest: &Digest) -> String {
        format!("{}/blob/{}", self.base_url, digest.hash())
    }

    /// Effective per-call timeout: the pool-level bound, capped by the
    /// caller's remaining deadline.
    fn call_timeout(&self, ctx: &RequestContext) -> Duration {
        match ctx.remaining() {
            Some(remaining) => remaining.min(self.rpc_timeout),
            None => self.rpc_timeout,
        }
    }

    fn prepare(&self, req: RequestBuilder, ctx: &RequestContext) -> RequestBuilder {
        let mut req = req.timeout(self.call_timeout(ctx));
        if let Some(identity) = ctx.identity() {
            req = req.header(IDENTITY_HEADER, identity);
        }
        if let Some(remaining) = ctx.remaining() {
            req = req.header(DEADLINE_HEADER, remaining.as_millis().to_string());
        }
        req
    }

    fn classify(&self, e: reqwest::Error) -> MeshError {
        if e.is_timeout() {
            MeshError::DeadlineExceeded
        } else if e.is_connect() {
            MeshError::unreachable(&self.peer, e.to_string())
        } else {
            MeshError::Network(format!("{}: {}", self.peer, e))
        }
    }

    /// Map a non-success response onto the error taxonomy.
    async fn error_from_response(&self, digest: &Digest, response: Response) -> MeshError {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => MeshError::NotFound(digest.to_string()),
            StatusCode::SERVICE_UNAVAILABLE => {
                MeshError::unreachable(&self.peer, "peer is draining")
            }
            StatusCode::REQUEST_TIMEOUT => MeshError::DeadlineExceeded,
            _ => MeshError::Storage(format!("{}: {}: {}", self.peer, status, message)),
        }
    }

    async fn send(
        &self,
        digest: &Digest,
        req: RequestBuilder,
        ctx: &RequestContext,
    ) -> Result<Response> {
        if ctx.expired() {
            return Err(MeshError::DeadlineExceeded);
        }
        let response = self
            .prepare(req, ctx)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(self.error_from_response(digest, response).await)
        }
    }
}

#[async_trait]
impl BlobCache for PeerClient {
    async fn read(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobReader> {
        let permit = self.acquire_slot().await?;
        let query = BlobQuery {
            size: digest.size_bytes(),
            offset,
        };
        let req = self.client.get(self.blob_url(digest)).query(&query);
        let response = self.send(digest, req, ctx).await?;

        let stream: Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>> = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        );
        let reader: BlobReader = Box::new(SlotReader {
            inner: StreamReader::new(stream),
            _permit: permit,
        });
        Ok(reader)
    }

    async fn write(&self, ctx: &RequestContext, digest: &Digest, data: Bytes) -> Result<()> {
        let _permit = self.acquire_slot().await?;
        let query = BlobQuery {
            size: digest.size_bytes(),
            offset: 0,
        };
        let req = self
            .client
            .put(self.blob_url(digest))
            .query(&query)
            .body(data);
        self.send(digest, req, ctx).await?;
        Ok(())
    }

    async fn contains(&self, ctx: &RequestContext, digest: &Digest) -> Result<bool> {
        let _permit = self.acquire_slot().await?;
        let query = BlobQuery {
            size: digest.size_bytes(),
            offset: 0,
        };
        let req = self
            .client
            .get(format!("{}/contains/{}", self.base_url, digest.hash()))
            .query(&query);
        let response = self.send(digest, req, ctx).await?;
        response
            .json::<bool>()
            .await
            .map_err(|e| MeshError::Serialization(e.to_string()))
    }

    async fn contains_multi(
        &self,
        ctx: &RequestContext,
        digests: &[Digest],
    ) -> Result<HashMap<Digest, bool>> {
        let _permit = self.acquire_slot().await?;
        let request = ContainsMultiRequest {
            digests: digests.to_vec(),
        };
        let req = self
            .client
            .post(format!("{}/blobs/contains", self.base_url))
            .json(&request);

        let anchor = Digest::new("", 0);
        let response = self.send(&anchor, req, ctx).await?;
        let body: ContainsMultiResponse = response
            .json()
            .await
            .map_err(|e| MeshError::Serialization(e.to_string()))?;

        Ok(digests
            .iter()
            .map(|d| {
                let present = body.found.get(d.hash()).copied().unwrap_or(false);
                (d.clone(), present)
            })
            .collect())
    }

    async fn get_multi(
        &self,
        ctx: &RequestContext,
        digests: &[Digest],
    ) -> Result<HashMap<Digest, Bytes>> {
        let _permit = self.acquire_slot().await?;
        let request = GetMultiRequest {
            digests: digests.to_vec(),
        };
        let req = self
            .client
            .post(format!("{}/blobs/fetch", self.base_url))
            .json(&request);

        let anchor = Digest::new("", 0);
        let response = self.send(&anchor, req, ctx).await?;
        let body: GetMultiResponse = response
            .json()
            .await
            .map_err(|e| MeshError::Serialization(e.to_string()))?;

        let mut blobs = HashMap::new();
        for digest in digests {
            if let Some(encoded) = body.blobs.get(digest.hash()) {
                let data = BASE64
                    .decode(encoded)
                    .map_err(|e| MeshError::Serialization(e.to_string()))?;
                blobs.insert(digest.clone(), Bytes::from(data));
            }
        }
        Ok(blobs)
    }

    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()> {
        let _permit = self.acquire_slot().await?;
        let req = self.client.delete(self.blob_url(digest));
        self.send(digest, req, ctx).await?;
        Ok(())
    }
}

/// A streamed response body that holds its RPC slot until dropped.
struct SlotReader<R> {
    inner: R,
    _permit: OwnedSemaphorePermit,
}

impl<R: AsyncRead + Unpin> AsyncRead for SlotReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_peer_is_classified() {
        // Nothing listens on this port.
        let client = PeerClient::new(
            "127.0.0.1:1".to_string(),
            Duration::from_millis(200),
            Duration::from_millis(500),
            4,
        );

        let err = client.heartbeat(Duration::from_millis(300)).await.unwrap_err();
        assert!(err.is_unreachable() || matches!(err, MeshError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_expired_context_short_circuits() {
        let client = PeerClient::new(
            "127.0.0.1:1".to_string(),
            Duration::from_millis(200),
            Duration::from_millis(500),
            4,
        );
        let ctx = RequestContext::anonymous().with_timeout(Duration::ZERO);
        let digest = Digest::compute(b"x");

        let err = client.contains(&ctx, &digest).await.unwrap_err();
        assert!(matches!(err, MeshError::DeadlineExceeded));
    }
}
