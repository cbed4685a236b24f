//! Node-to-node RPC for meshcache.
//!
//! The wire surface mirrors the backing cache contract one-to-one:
//!
//! | Route | Method | Operation |
//! |---|---|---|
//! | `/health` | GET | heartbeat / readiness |
//! | `/blob/:hash` | GET | read (streamed body) |
//! | `/blob/:hash` | PUT | write |
//! | `/blob/:hash` | DELETE | delete |
//! | `/contains/:hash` | GET | contains |
//! | `/blobs/contains` | POST | batched contains |
//! | `/blobs/fetch` | POST | batched fetch |
//!
//! Caller identity and the remaining deadline ride on every request as
//! headers, so the callee can enforce the caller's budget and the
//! application's multi-tenancy layer sees a consistent identity
//! end-to-end.

mod client;
mod pool;
mod server;

pub use client::PeerClient;
pub use pool::PeerClientPool;
pub use server::{router, RpcState};

use crate::types::Digest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque caller identity, passed through from the request context.
pub const IDENTITY_HEADER: &str = "x-meshcache-identity";

/// Remaining milliseconds of the caller's deadline.
pub const DEADLINE_HEADER: &str = "x-meshcache-deadline-ms";

/// Query parameters for single-blob routes.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlobQuery {
    /// Declared content size of the digest.
    #[serde(default)]
    pub size: u64,
    /// Read offset; writes ignore it.
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContainsMultiRequest {
    pub digests: Vec<Digest>,
}

/// Existence results keyed by digest hash.
#[derive(Debug, Serialize, Deserialize)]
pub struct ContainsMultiResponse {
    pub found: HashMap<String, bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetMultiRequest {
    pub digests: Vec<Digest>,
}

/// Blob payloads keyed by digest hash, base64-encoded. Missing digests
/// are omitted.
#[derive(Debug, Serialize, Deserialize)]
pub struct GetMultiResponse {
    pub blobs: HashMap<String, String>,
}
