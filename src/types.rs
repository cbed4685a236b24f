//! Core type definitions for meshcache.
//!
//! This module contains the fundamental data types used throughout the
//! crate:
//!
//! - [`Digest`]: opaque content identifier (SHA-256 hash + declared size)
//! - [`PeerAddr`]: network address of a cluster peer
//! - [`RequestContext`]: per-call identity and deadline, propagated on
//!   every RPC
//! - [`PeerLiveness`]: advisory liveness state derived from heartbeats
//!
//! # Digests
//!
//! Digests are immutable value objects. Equality and hashing consider the
//! content hash only; the declared size is advisory metadata used for
//! buffer sizing and wire-level sanity checks.
//!
//! ```rust
//! use meshcache::types::Digest;
//!
//! let d = Digest::compute(b"hello world");
//! assert_eq!(d.size_bytes(), 11);
//!
//! let same = Digest::new(d.hash().to_string(), 0);
//! assert_eq!(d, same); // size does not participate in equality
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Network address of a peer (`host:port`). Peers are declared at
/// configuration time; the set is fixed for the lifetime of a node.
pub type PeerAddr = String;

/// Opaque content identifier: a stable hex-encoded SHA-256 hash plus the
/// declared content size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    hash: String,
    size_bytes: u64,
}

impl Digest {
    /// Create a digest from a known hash and declared size. The hash is
    /// normalized to lowercase.
    pub fn new(hash: impl Into<String>, size_bytes: u64) -> Self {
        let mut hash = hash.into();
        hash.make_ascii_lowercase();
        Self { hash, size_bytes }
    }

    /// Compute the digest of a byte slice.
    pub fn compute(data: &[u8]) -> Self {
        let hash = hex::encode(Sha256::digest(data));
        Self {
            hash,
            size_bytes: data.len() as u64,
        }
    }

    /// The hex-encoded content hash.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The declared content size. Advisory: not part of identity.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Digest {}

impl Hash for Digest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = &self.hash[..self.hash.len().min(12)];
        write!(f, "{}/{}", short, self.size_bytes)
    }
}

/// Per-call context: opaque caller identity plus an optional deadline.
///
/// The identity is attached at the application layer and passed through
/// end-to-end on every RPC; the coordinator never inspects it. Deadlines
/// propagate as the remaining time on the wire. Cancellation is
/// Rust-native: dropping an operation future cancels its in-flight peer
/// RPCs and local adapter calls.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    identity: Option<String>,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context with no identity and no deadline.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Context carrying an opaque caller identity.
    pub fn with_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            deadline: None,
        }
    }

    /// Attach a deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Attach an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining before the deadline, or `None` when unbounded.
    /// A context past its deadline reports `Some(Duration::ZERO)`.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has already fired.
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }
}

/// Advisory liveness state of a peer, derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerLiveness {
    /// Heartbeat seen within one interval.
    Live,
    /// Heartbeat seen within two intervals; still routed to.
    Suspect,
    /// Two or more intervals missed, or never heard from.
    Down,
}

impl PeerLiveness {
    /// Whether the peer should be considered reachable for routing.
    pub fn is_live(&self) -> bool {
        !matches!(self, PeerLiveness::Down)
    }
}

/// Snapshot of one peer's health, as tracked by the membership tracker.
#[derive(Debug, Clone, Copy)]
pub struct PeerHealth {
    /// Current liveness state.
    pub state: PeerLiveness,
    /// When the last successful heartbeat completed.
    pub last_heartbeat: Option<Instant>,
}

impl Default for PeerHealth {
    fn default() -> Self {
        Self {
            state: PeerLiveness::Down,
            last_heartbeat: None,
        }
    }
}
