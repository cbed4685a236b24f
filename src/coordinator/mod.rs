//! The replication coordinator.
//!
//! [`DistributedCache`] is the public cache facade: it implements the same
//! [`BlobCache`] contract as a local store and turns every call into a
//! cross-node operation over the replica set. It owns the node lifecycle
//! (inbound RPC server, membership tracker, backfill scheduler) and all
//! failure handling: write fan-out with preference-list handoff, read
//! fallback with repair, and batched walks for the multi-key operations.
//!
//! Placement decides *where* a digest lives; liveness only decides which
//! replica is tried first. Inbound RPC handlers never reach back into this
//! type — they operate on local storage only, which is how the recursion
//! bottoms out.

mod backfill;

use crate::backing::{BlobCache, BlobReader};
use crate::cluster::{MembershipTracker, RendezvousPlacement};
use crate::config::CacheConfig;
use crate::error::{MeshError, Result};
use crate::observability;
use crate::rpc::{router, PeerClientPool, RpcState};
use crate::types::{Digest, PeerAddr, RequestContext};
use async_trait::async_trait;
use backfill::{BackfillTarget, Backfiller, CaptureReader};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default drain budget when the shutdown context has no deadline.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Node lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, not yet serving.
    New,
    /// Serving inbound RPCs and accepting operations.
    Listening,
    /// Refusing new work, draining in-flight operations.
    Draining,
    /// Fully stopped. May be restarted.
    Closed,
}

/// Shared lifecycle gate: tracks the state machine and the number of
/// in-flight coordinator operations so shutdown can drain them.
pub struct Lifecycle {
    state: RwLock<LifecycleState>,
    inflight: AtomicUsize,
    drained: Notify,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: RwLock::new(LifecycleState::New),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == LifecycleState::Listening
    }

    fn set(&self, state: LifecycleState) {
        *self.state.write() = state;
    }

    /// Register one operation. Fails unless the node is listening.
    fn begin_op(this: &Arc<Self>) -> Result<OpGuard> {
        if !this.is_listening() {
            return Err(MeshError::ShuttingDown);
        }
        this.inflight.fetch_add(1, Ordering::SeqCst);
        Ok(OpGuard(Arc::clone(this)))
    }

    fn finish_op(&self) {
        if self.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the in-flight count when dropped.
struct OpGuard(Arc<Lifecycle>);

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.0.finish_op();
    }
}

/// Background tasks of one listening period.
struct ListenerHandle {
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<()>,
    membership_task: JoinHandle<()>,
}

/// The per-node replication coordinator and public cache facade.
pub struct DistributedCache {
    config: CacheConfig,
    local: Arc<dyn BlobCache>,
    placement: RendezvousPlacement,
    pool: Arc<PeerClientPool>,
    membership: Arc<MembershipTracker>,
    backfiller: Arc<Backfiller>,
    lifecycle: Arc<Lifecycle>,
    listener: tokio::sync::Mutex<Option<ListenerHandle>>,
}

impl std::fmt::Debug for DistributedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCache").finish_non_exhaustive()
    }
}

impl DistributedCache {
    /// Build a coordinator over `local` storage. Validates the config;
    /// nothing is dialed and nothing listens until [`start_listening`].
    ///
    /// [`start_listening`]: DistributedCache::start_listening
    pub fn new(config: CacheConfig, local: Arc<dyn BlobCache>) -> Result<Self> {
        config.validate()?;

        let placement =
            RendezvousPlacement::new(config.nodes.clone(), config.replication_factor);
        let pool = Arc::new(PeerClientPool::new(&config));
        let membership = Arc::new(MembershipTracker::new(
            config.listen_addr.clone(),
            config.nodes.clone(),
            config.rpc_heartbeat_interval,
        ));
        let backfiller = Arc::new(Backfiller::new(config.backfill_concurrency));

        Ok(Self {
            config,
            local,
            placement,
            pool,
            membership,
            backfiller,
            lifecycle: Arc::new(Lifecycle::new()),
            listener: tokio::sync::Mutex::new(None),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Bind the inbound RPC listener and start the membership tracker.
    /// A closed node may be restarted; membership history resets.
    pub async fn start_listening(&self) -> Result<()> {
        let mut slot = self.listener.lock().await;
        match self.lifecycle.state() {
            LifecycleState::Listening => return Ok(()),
            LifecycleState::Draining => return Err(MeshError::ShuttingDown),
            LifecycleState::New | LifecycleState::Closed => {}
        }

        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| MeshError::InvalidConfig {
                field: "listen_addr".to_string(),
                reason: format!("{}", e),
            })?;
        let tcp = TcpListener::bind(addr).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Inbound handlers see local storage only; the coordinator is
        // deliberately absent from the RPC state.
        let app = router(RpcState::new(
            Arc::clone(&self.local),
            Arc::clone(&self.lifecycle),
        ));
        let mut server_shutdown = shutdown_rx.clone();
        let server_task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = server_shutdown.changed().await;
            };
            if let Err(e) = axum::serve(tcp, app).with_graceful_shutdown(shutdown).await {
                error!(error = %e, "rpc server error");
            }
        });

        self.membership.reset();
        self.membership.set_listening(true);
        let membership_task = tokio::spawn(
            Arc::clone(&self.membership).run(Arc::clone(&self.pool), shutdown_rx),
        );

        self.backfiller.reopen();
        self.lifecycle.set(LifecycleState::Listening);
        *slot = Some(ListenerHandle {
            shutdown_tx,
            server_task,
            membership_task,
        });

        info!(addr = %self.config.listen_addr, "cache node listening");
        Ok(())
    }

    /// Stop accepting inbound RPCs, drain in-flight operations and
    /// backfills within the context deadline, and close down. Idempotent
    /// once closed.
    pub async fn shutdown(&self, ctx: &RequestContext) -> Result<()> {
        let mut slot = self.listener.lock().await;
        match self.lifecycle.state() {
            LifecycleState::Closed => return Ok(()),
            LifecycleState::New => {
                self.lifecycle.set(LifecycleState::Closed);
                return Ok(());
            }
            LifecycleState::Listening | LifecycleState::Draining => {}
        }

        let budget = ctx.remaining().unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        let started = Instant::now();
        let remaining = |started: Instant| budget.saturating_sub(started.elapsed());

        info!(addr = %self.config.listen_addr, "cache node draining");
        self.lifecycle.set(LifecycleState::Draining);
        self.membership.set_listening(false);

        let handle = slot.take();
        if let Some(h) = &handle {
            let _ = h.shutdown_tx.send(true);
        }

        if tokio::time::timeout(remaining(started), self.lifecycle.wait_drained())
            .await
            .is_err()
        {
            warn!("shutdown deadline hit with operations still in flight");
        }

        self.backfiller.drain(remaining(started)).await;

        if let Some(mut h) = handle {
            if tokio::time::timeout(remaining(started), &mut h.server_task)
                .await
                .is_err()
            {
                h.server_task.abort();
            }
            h.membership_task.abort();
        }

        self.lifecycle.set(LifecycleState::Closed);
        info!(addr = %self.config.listen_addr, "cache node closed");
        Ok(())
    }

    /// Uniform handle for a replica: the local adapter for self (unless
    /// local lookup is disabled), otherwise the peer's client.
    fn handle_for(&self, peer: &PeerAddr) -> Result<Arc<dyn BlobCache>> {
        if *peer == self.config.listen_addr && !self.config.disable_local_lookup {
            return Ok(Arc::clone(&self.local));
        }
        let client = self.pool.client(peer)?;
        Ok(client as Arc<dyn BlobCache>)
    }

    /// Live replicas of R(D) in preference order. Extends past the top-R
    /// when none of them are live; falls back to the unfiltered replica
    /// set when the whole snapshot looks dead, so a stale liveness map
    /// degrades rather than disables reads.
    fn read_candidates(&self, digest: &Digest) -> Vec<PeerAddr> {
        let prefs = self.placement.preference_list(digest);
        let r = self.config.replication_factor;

        let live_top: Vec<PeerAddr> = prefs[..r]
            .iter()
            .filter(|p| self.membership.is_live(p))
            .cloned()
            .collect();
        if !live_top.is_empty() {
            return live_top;
        }

        let live_rest: Vec<PeerAddr> = prefs[r..]
            .iter()
            .filter(|p| self.membership.is_live(p))
            .cloned()
            .collect();
        if !live_rest.is_empty() {
            return live_rest;
        }

        prefs[..r].to_vec()
    }

    /// First R live peers of the preference list, topped up with
    /// unproven peers when fewer than R are known live. The write fan-out
    /// discovers real reachability; stale liveness only costs a retry.
    fn write_targets(&self, prefs: &[PeerAddr]) -> Vec<PeerAddr> {
        let r = self.config.replication_factor;
        let mut targets: Vec<PeerAddr> = prefs
            .iter()
            .filter(|p| self.membership.is_live(p))
            .take(r)
            .cloned()
            .collect();

        if targets.len() < r {
            for peer in prefs {
                if targets.len() == r {
                    break;
                }
                if !targets.contains(peer) {
                    targets.push(peer.clone());
                }
            }
        }

        targets
    }

    async fn replicated_write(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        data: Bytes,
    ) -> Result<()> {
        let _guard = Lifecycle::begin_op(&self.lifecycle)?;
        if ctx.expired() {
            return Err(MeshError::DeadlineExceeded);
        }
        observability::record_op("meshcache_writes_total");

        with_deadline(ctx, self.write_all_replicas(ctx, digest, data)).await
    }

    /// Fan the write out until R distinct peers acknowledge. A failed
    /// target is handed off to the next unused peer in the preference
    /// order when the failure is attributable to reachability; storage
    /// errors fail the write outright. The durability target is R, not a
    /// quorum: fewer than R acknowledgments is a failed write.
    async fn write_all_replicas(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        data: Bytes,
    ) -> Result<()> {
        let prefs = self.placement.preference_list(digest);
        let r = self.config.replication_factor;

        let mut wave = self.write_targets(&prefs);
        let mut used: HashSet<PeerAddr> = wave.iter().cloned().collect();
        let mut acked = 0usize;
        let mut first_err: Option<MeshError> = None;

        while !wave.is_empty() {
            let writes = wave.drain(..).map(|peer| {
                let handle = self.handle_for(&peer);
                let data = data.clone();
                async move {
                    let result = match handle {
                        Ok(h) => h.write(ctx, digest, data).await,
                        Err(e) => Err(e),
                    };
                    (peer, result)
                }
            });

            let mut next_wave = Vec::new();
            for (peer, result) in join_all(writes).await {
                match result {
                    Ok(()) => acked += 1,
                    Err(e) => {
                        debug!(digest = %digest, peer = %peer, error = %e, "replica write failed");
                        let retryable = e.is_retryable();
                        if first_err.is_none() {
                            first_err = Some(MeshError::write_failed(peer, e));
                        }
                        if retryable {
                            let next = prefs
                                .iter()
                                .find(|p| !used.contains(*p) && self.membership.is_live(p))
                                .or_else(|| prefs.iter().find(|p| !used.contains(*p)));
                            if let Some(next) = next {
                                used.insert(next.clone());
                                next_wave.push(next.clone());
                            }
                        }
                    }
                }
            }
            wave = next_wave;
        }

        if acked >= r {
            Ok(())
        } else {
            Err(first_err
                .unwrap_or_else(|| MeshError::Internal("write acknowledged by no replica".into())))
        }
    }

    async fn replicated_read(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobReader> {
        let guard = Lifecycle::begin_op(&self.lifecycle)?;
        if ctx.expired() {
            return Err(MeshError::DeadlineExceeded);
        }
        observability::record_op("meshcache_reads_total");

        let candidates = self.read_candidates(digest);
        let mut misses: HashSet<PeerAddr> = HashSet::new();
        let mut last_err: Option<MeshError> = None;

        for (idx, peer) in candidates.iter().enumerate() {
            let attempt = async {
                self.handle_for(peer)?.read(ctx, digest, offset).await
            };
            match with_deadline(ctx, attempt).await {
                Ok(reader) => {
                    if idx > 0 {
                        observability::record_op("meshcache_read_fallbacks_total");
                    }
                    return Ok(self.finish_read(ctx, digest, offset, peer, &misses, reader, guard));
                }
                Err(e) if e.is_not_found() => {
                    misses.insert(peer.clone());
                }
                Err(e) => {
                    if ctx.expired() {
                        return Err(MeshError::DeadlineExceeded);
                    }
                    debug!(digest = %digest, peer = %peer, error = %e, "replica read failed");
                    last_err = Some(e);
                }
            }
        }

        if !misses.is_empty() {
            Err(MeshError::NotFound(digest.to_string()))
        } else {
            Err(last_err.unwrap_or_else(|| {
                MeshError::unreachable(
                    candidates.first().cloned().unwrap_or_default(),
                    "no replicas available",
                )
            }))
        }
    }

    /// Wrap a successful read: tee the stream so the full blob can be
    /// handed to the backfiller once the caller finishes consuming it.
    /// Repairs go to replicas the walk saw missing, plus any other live
    /// replica whose copy the probe finds absent.
    fn finish_read(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        offset: u64,
        source: &PeerAddr,
        misses: &HashSet<PeerAddr>,
        reader: BlobReader,
        guard: OpGuard,
    ) -> BlobReader {
        if offset != 0 {
            return Box::new(GuardedReader {
                inner: reader,
                _guard: guard,
            });
        }

        let mut targets = Vec::new();
        for peer in self.placement.replicas(digest) {
            if peer == *source {
                continue;
            }
            let known_missing = misses.contains(&peer);
            if !known_missing && !self.membership.is_live(&peer) {
                continue;
            }
            match self.handle_for(&peer) {
                Ok(handle) => targets.push(BackfillTarget {
                    peer,
                    handle,
                    known_missing,
                }),
                Err(e) => warn!(peer = %peer, error = %e, "no handle for backfill target"),
            }
        }

        if targets.is_empty() {
            return Box::new(GuardedReader {
                inner: reader,
                _guard: guard,
            });
        }

        let backfiller = Arc::clone(&self.backfiller);
        let identity = ctx.identity().map(str::to_string);
        let digest = digest.clone();
        let capture = CaptureReader::new(reader, digest.size_bytes() as usize, move |data| {
            backfiller.schedule(identity, &digest, data, targets);
        });

        Box::new(GuardedReader {
            inner: Box::new(capture),
            _guard: guard,
        })
    }

    async fn replicated_contains(&self, ctx: &RequestContext, digest: &Digest) -> Result<bool> {
        let _guard = Lifecycle::begin_op(&self.lifecycle)?;
        if ctx.expired() {
            return Err(MeshError::DeadlineExceeded);
        }

        let walk = async {
            let candidates = self.read_candidates(digest);
            let mut confirmed_negative = false;
            let mut last_err: Option<MeshError> = None;

            for peer in &candidates {
                let attempt = async { self.handle_for(peer)?.contains(ctx, digest).await };
                match attempt.await {
                    Ok(true) => return Ok(true),
                    Ok(false) => confirmed_negative = true,
                    Err(e) => {
                        debug!(digest = %digest, peer = %peer, error = %e, "replica contains failed");
                        last_err = Some(e);
                    }
                }
            }

            if confirmed_negative {
                Ok(false)
            } else {
                Err(last_err.unwrap_or_else(|| {
                    MeshError::unreachable(
                        candidates.first().cloned().unwrap_or_default(),
                        "no replicas available",
                    )
                }))
            }
        };

        with_deadline(ctx, walk).await
    }

    async fn replicated_contains_multi(
        &self,
        ctx: &RequestContext,
        digests: &[Digest],
    ) -> Result<HashMap<Digest, bool>> {
        let _guard = Lifecycle::begin_op(&self.lifecycle)?;
        if ctx.expired() {
            return Err(MeshError::DeadlineExceeded);
        }

        with_deadline(ctx, async {
            let mut result: HashMap<Digest, bool> = HashMap::with_capacity(digests.len());
            let mut walk = BatchWalk::new(self, digests);

            while let Some(groups) = walk.next_round(&result) {
                let responses = join_all(groups.into_iter().map(|(peer, group)| {
                    let handle = self.handle_for(&peer);
                    async move {
                        let res = match handle {
                            Ok(h) => h.contains_multi(ctx, &group).await,
                            Err(e) => Err(e),
                        };
                        (peer, group, res)
                    }
                }))
                .await;

                for (peer, group, res) in responses {
                    match res {
                        Ok(found) => {
                            for digest in group {
                                let present = found.get(&digest).copied().unwrap_or(false);
                                result.insert(digest, present);
                            }
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "batched contains failed, walking on");
                            walk.retry(group);
                        }
                    }
                }
            }

            // Digests whose every candidate errored resolve to false; an
            // existence check degrades instead of failing the batch.
            for digest in walk.exhausted() {
                warn!(digest = %digest, "no reachable replica for existence check");
                result.insert(digest, false);
            }

            Ok(result)
        })
        .await
    }

    async fn replicated_get_multi(
        &self,
        ctx: &RequestContext,
        digests: &[Digest],
    ) -> Result<HashMap<Digest, Bytes>> {
        let _guard = Lifecycle::begin_op(&self.lifecycle)?;
        if ctx.expired() {
            return Err(MeshError::DeadlineExceeded);
        }

        with_deadline(ctx, async {
            let mut result: HashMap<Digest, Bytes> = HashMap::new();
            let mut resolved_absent: HashSet<Digest> = HashSet::new();
            let mut walk = BatchWalk::new(self, digests);
            let mut last_err: Option<MeshError> = None;

            loop {
                let groups = {
                    let done: HashSet<&Digest> =
                        result.keys().chain(resolved_absent.iter()).collect();
                    walk.next_round_filtered(|d| done.contains(d))
                };
                let Some(groups) = groups else { break };

                let responses = join_all(groups.into_iter().map(|(peer, group)| {
                    let handle = self.handle_for(&peer);
                    async move {
                        let res = match handle {
                            Ok(h) => h.get_multi(ctx, &group).await,
                            Err(e) => Err(e),
                        };
                        (peer, group, res)
                    }
                }))
                .await;

                for (peer, group, res) in responses {
                    match res {
                        Ok(mut blobs) => {
                            for digest in group {
                                match blobs.remove(&digest) {
                                    Some(data) => {
                                        result.insert(digest, data);
                                    }
                                    // The peer answered and does not hold
                                    // it: absent from the merged result.
                                    None => {
                                        resolved_absent.insert(digest);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "batched fetch failed, walking on");
                            last_err = Some(e);
                            walk.retry(group);
                        }
                    }
                }
            }

            // A digest that saw nothing but errors across every candidate
            // is unreachable; that is the one case the batch reports.
            if !walk.exhausted().is_empty() {
                return Err(last_err
                    .unwrap_or_else(|| MeshError::Internal("no replicas available".into())));
            }

            Ok(result)
        })
        .await
    }

    async fn replicated_delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()> {
        let _guard = Lifecycle::begin_op(&self.lifecycle)?;
        if ctx.expired() {
            return Err(MeshError::DeadlineExceeded);
        }

        let fan_out = async {
            let prefs = self.placement.preference_list(digest);
            let targets = self.write_targets(&prefs);

            let deletes = targets.into_iter().map(|peer| {
                let handle = self.handle_for(&peer);
                async move {
                    let result = match handle {
                        Ok(h) => h.delete(ctx, digest).await,
                        Err(e) => Err(e),
                    };
                    (peer, result)
                }
            });

            for (peer, result) in join_all(deletes).await {
                if let Err(e) = result {
                    return Err(MeshError::write_failed(peer, e));
                }
            }
            Ok(())
        };

        with_deadline(ctx, fan_out).await
    }
}

#[async_trait]
impl BlobCache for DistributedCache {
    async fn read(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobReader> {
        self.replicated_read(ctx, digest, offset).await
    }

    async fn write(&self, ctx: &RequestContext, digest: &Digest, data: Bytes) -> Result<()> {
        self.replicated_write(ctx, digest, data).await
    }

    async fn contains(&self, ctx: &RequestContext, digest: &Digest) -> Result<bool> {
        self.replicated_contains(ctx, digest).await
    }

    async fn contains_multi(
        &self,
        ctx: &RequestContext,
        digests: &[Digest],
    ) -> Result<HashMap<Digest, bool>> {
        self.replicated_contains_multi(ctx, digests).await
    }

    async fn get_multi(
        &self,
        ctx: &RequestContext,
        digests: &[Digest],
    ) -> Result<HashMap<Digest, Bytes>> {
        self.replicated_get_multi(ctx, digests).await
    }

    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()> {
        self.replicated_delete(ctx, digest).await
    }
}

/// Round-based walk for the batched operations: each unresolved digest
/// advances through its candidate list one peer per round, and digests
/// sharing a current candidate are batched into one RPC.
struct BatchWalk {
    candidates: HashMap<Digest, Vec<PeerAddr>>,
    cursor: HashMap<Digest, usize>,
    pending: Vec<Digest>,
    exhausted: Vec<Digest>,
}

impl BatchWalk {
    fn new(coordinator: &DistributedCache, digests: &[Digest]) -> Self {
        let mut seen = HashSet::new();
        let unique: Vec<Digest> = digests
            .iter()
            .filter(|d| seen.insert((*d).clone()))
            .cloned()
            .collect();

        let candidates = unique
            .iter()
            .map(|d| (d.clone(), coordinator.read_candidates(d)))
            .collect();
        let cursor = unique.iter().map(|d| (d.clone(), 0usize)).collect();

        Self {
            candidates,
            cursor,
            pending: unique,
            exhausted: Vec::new(),
        }
    }

    /// Group the pending digests by their current candidate, skipping
    /// ones already present in `resolved`. Returns `None` once nothing is
    /// left to try.
    fn next_round<V>(
        &mut self,
        resolved: &HashMap<Digest, V>,
    ) -> Option<HashMap<PeerAddr, Vec<Digest>>> {
        self.next_round_filtered(|d| resolved.contains_key(d))
    }

    fn next_round_filtered(
        &mut self,
        resolved: impl Fn(&Digest) -> bool,
    ) -> Option<HashMap<PeerAddr, Vec<Digest>>> {
        let mut groups: HashMap<PeerAddr, Vec<Digest>> = HashMap::new();

        for digest in std::mem::take(&mut self.pending) {
            if resolved(&digest) {
                continue;
            }
            let cands = &self.candidates[&digest];
            let idx = self.cursor[&digest];
            if idx >= cands.len() {
                self.exhausted.push(digest);
                continue;
            }
            groups.entry(cands[idx].clone()).or_default().push(digest);
        }

        if groups.is_empty() {
            None
        } else {
            Some(groups)
        }
    }

    /// Put a failed group back, advanced to its next candidate.
    fn retry(&mut self, group: Vec<Digest>) {
        for digest in group {
            *self.cursor.get_mut(&digest).expect("walk knows digest") += 1;
            self.pending.push(digest);
        }
    }

    /// Digests that ran out of candidates.
    fn exhausted(&self) -> Vec<Digest> {
        self.exhausted.clone()
    }
}

/// Wraps a read stream so the operation counts as in flight until the
/// caller finishes consuming it.
struct GuardedReader {
    inner: BlobReader,
    _guard: OpGuard,
}

impl AsyncRead for GuardedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Run `fut` under the context deadline, if any.
async fn with_deadline<T, F>(ctx: &RequestContext, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match ctx.remaining() {
        Some(remaining) => match tokio::time::timeout(remaining, fut).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::DeadlineExceeded),
        },
        None => fut.await,
    }
}
