//! Error types for meshcache.
//!
//! This module provides a unified error type [`MeshError`] for all cache
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **NotFound**: no live replica holds the digest; recoverable by the caller
//! - **PeerUnreachable**: a specific peer could not be contacted
//! - **Io / Storage**: backing-cache or wire-level failures
//! - **DeadlineExceeded**: the operation's deadline fired
//! - **InvalidConfig**: misconfiguration detected at construction
//! - **ShuttingDown**: operation attempted while draining or closed
//!
//! `PeerUnreachable` is deliberately distinct from `Io`: the coordinator
//! counts unreachable peers against liveness and masks them when another
//! replica can serve the request, while `Io` is attributed to the peer that
//! produced it.

use std::io;
use thiserror::Error;

/// Main error type for meshcache operations.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("digest not found: {0}")]
    NotFound(String),

    #[error("peer unreachable: {peer}: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("write to replica {peer} failed: {source}")]
    WriteFailed {
        peer: String,
        #[source]
        source: Box<MeshError>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Build a `PeerUnreachable` error for the given peer.
    pub fn unreachable(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        MeshError::PeerUnreachable {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Build a `WriteFailed` error tagging `source` with the failing peer.
    pub fn write_failed(peer: impl Into<String>, source: MeshError) -> Self {
        MeshError::WriteFailed {
            peer: peer.into(),
            source: Box::new(source),
        }
    }

    /// True for `NotFound`, including one wrapped by `WriteFailed`.
    pub fn is_not_found(&self) -> bool {
        match self {
            MeshError::NotFound(_) => true,
            MeshError::WriteFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True when the error means a peer could not be contacted at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            MeshError::PeerUnreachable { .. } => true,
            MeshError::WriteFailed { source, .. } => source.is_unreachable(),
            _ => false,
        }
    }

    /// Check if the error is worth retrying at a different replica.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::PeerUnreachable { .. }
                | MeshError::Io(_)
                | MeshError::Network(_)
                | MeshError::DeadlineExceeded
        )
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

/// Result type alias for meshcache operations.
pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_through_write_failed() {
        let err = MeshError::write_failed("peer-a:2020", MeshError::NotFound("abc".into()));
        assert!(err.is_not_found());
        assert!(!err.is_unreachable());
    }

    #[test]
    fn test_unreachable_is_retryable() {
        let err = MeshError::unreachable("peer-b:2021", "connection refused");
        assert!(err.is_unreachable());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_config_error_not_retryable() {
        let err = MeshError::InvalidConfig {
            field: "replication_factor".into(),
            reason: "must be >= 1".into(),
        };
        assert!(!err.is_retryable());
    }
}
