//! Synchronisation orchestrator.
//!
//! Drives one sync at a time through two phases: a single-peer hash
//! backfill that walks from the target head to the first locally-known
//! ancestor, then a ticker-driven parallel block download that fans
//! reservations out to idle peers. Inbound deliveries from the transport
//! layer arrive over depth-1 mpsc channels so that a slow engine
//! backpressures the wire; a watch channel carries the cancel signal into
//! every select arm.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strand_core::error::{PeerSetError, SyncError};
use strand_core::traits::{ChainView, FetchTransport};
use strand_core::types::{Block, Hash256};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::peers::{Peer, PeerSet};
use crate::queue::BlockQueue;

/// A hash batch handed in by the transport layer.
struct HashDelivery {
    peer_id: String,
    hashes: Vec<Hash256>,
}

/// A block batch handed in by the transport layer.
struct BlockDelivery {
    peer_id: String,
    blocks: Vec<Block>,
}

/// The block-chain synchronisation engine.
///
/// Owns the peer set, the scheduling queue and the delivery channels. At
/// most one [`synchronise`](Self::synchronise) runs at a time, enforced by
/// an atomic compare-and-set; a second concurrent caller gets
/// [`SyncError::Busy`] without side effects.
pub struct Downloader {
    chain: Arc<dyn ChainView>,
    config: SyncConfig,
    peers: PeerSet,
    queue: Mutex<BlockQueue>,
    synchronising: AtomicBool,
    hash_tx: mpsc::Sender<HashDelivery>,
    hash_rx: tokio::sync::Mutex<mpsc::Receiver<HashDelivery>>,
    block_tx: mpsc::Sender<BlockDelivery>,
    block_rx: tokio::sync::Mutex<mpsc::Receiver<BlockDelivery>>,
    cancel_tx: watch::Sender<bool>,
}

impl Downloader {
    /// Create a downloader over the given local chain view.
    pub fn new(chain: Arc<dyn ChainView>, config: SyncConfig) -> Self {
        let (hash_tx, hash_rx) = mpsc::channel(1);
        let (block_tx, block_rx) = mpsc::channel(1);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            queue: Mutex::new(BlockQueue::new(config.block_cache_limit)),
            chain,
            config,
            peers: PeerSet::new(),
            synchronising: AtomicBool::new(false),
            hash_tx,
            hash_rx: tokio::sync::Mutex::new(hash_rx),
            block_tx,
            block_rx: tokio::sync::Mutex::new(block_rx),
            cancel_tx,
        }
    }

    /// Register a peer under `id` with its claimed head and transport.
    pub fn register_peer(
        &self,
        id: &str,
        head: Hash256,
        transport: Arc<dyn FetchTransport>,
    ) -> Result<(), PeerSetError> {
        self.peers.register(Peer::new(id, head, transport))
    }

    /// Remove a peer from the set.
    pub fn unregister_peer(&self, id: &str) -> Result<(), PeerSetError> {
        self.peers.unregister(id)
    }

    /// Whether a synchronisation is currently running.
    pub fn is_synchronising(&self) -> bool {
        self.synchronising.load(Ordering::Acquire)
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Reputation score of a registered peer, if present.
    pub fn peer_reputation(&self, id: &str) -> Option<i32> {
        self.peers.peer(id).map(|p| p.rep())
    }

    /// `(pending hashes, cached blocks)` in the queue.
    pub fn stats(&self) -> (usize, usize) {
        self.queue.lock().size()
    }

    /// Run a full synchronisation against peer `id` from `head`.
    ///
    /// Resolves once both phases complete or fail. Fails fast with
    /// [`SyncError::Busy`] when a sync is already running,
    /// [`SyncError::PendingQueue`] when undrained blocks from a previous run
    /// still await the consumer, and [`SyncError::UnknownPeer`] when `id` is
    /// not registered. Any error after that point resets the queue.
    pub async fn synchronise(&self, id: &str, head: Hash256) -> Result<(), SyncError> {
        if self
            .synchronising
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::Busy);
        }

        let result = self.sync_with(id, head).await;
        self.synchronising.store(false, Ordering::Release);

        match &result {
            Ok(()) => info!(peer = id, "sync: completed"),
            // Residual blocks stay put for the consumer to drain.
            Err(SyncError::PendingQueue) => {}
            Err(e) => {
                warn!(peer = id, error = %e, "sync: failed");
                self.drain_channels();
                self.queue.lock().reset();
            }
        }
        result
    }

    async fn sync_with(&self, id: &str, head: Hash256) -> Result<(), SyncError> {
        if self.queue.lock().head_block().is_some() {
            return Err(SyncError::PendingQueue);
        }
        self.queue.lock().reset();
        self.peers.reset();
        // Stale deliveries parked in the channels since the last run would
        // otherwise masquerade as responses to the new target.
        self.drain_channels();
        self.cancel_tx.send_replace(false);

        let origin = self
            .peers
            .peer(id)
            .ok_or_else(|| SyncError::UnknownPeer(id.to_string()))?;
        info!(peer = id, head = %head.short(), "sync: starting");

        self.fetch_hashes(origin, head).await?;
        self.fetch_blocks().await
    }

    /// Deliver a hash batch on behalf of `peer_id`.
    ///
    /// Rejected with [`SyncError::NoSyncActive`] when no sync runs; the
    /// depth-1 channel otherwise backpressures the transport.
    pub async fn deliver_hashes(&self, peer_id: &str, hashes: Vec<Hash256>) -> Result<(), SyncError> {
        if !self.is_synchronising() {
            return Err(SyncError::NoSyncActive);
        }
        self.hash_tx
            .send(HashDelivery {
                peer_id: peer_id.to_string(),
                hashes,
            })
            .await
            .map_err(|_| SyncError::NoSyncActive)
    }

    /// Deliver a block batch on behalf of `peer_id`.
    pub async fn deliver_blocks(&self, peer_id: &str, blocks: Vec<Block>) -> Result<(), SyncError> {
        if !self.is_synchronising() {
            return Err(SyncError::NoSyncActive);
        }
        self.block_tx
            .send(BlockDelivery {
                peer_id: peer_id.to_string(),
                blocks,
            })
            .await
            .map_err(|_| SyncError::NoSyncActive)
    }

    /// Drain chain-ordered blocks whose parent the local chain already
    /// knows. Returns an empty vector when nothing is deliverable yet.
    pub fn take_blocks(&self) -> Vec<Block> {
        let mut queue = self.queue.lock();
        let parent = match queue.head_block() {
            Some(block) => block.parent_hash(),
            None => return Vec::new(),
        };
        if !self.chain.has_block(&parent) {
            return Vec::new();
        }
        queue.take_blocks()
    }

    /// Abort an in-flight sync and discard queued state.
    ///
    /// Returns `false` when nothing was running and nothing was queued.
    pub fn cancel(&self) -> bool {
        let was_running = self.is_synchronising();
        let had_state = self.queue.lock().size() != (0, 0);
        if !was_running && !had_state {
            return false;
        }

        info!(was_running, "sync: cancelling");
        self.cancel_tx.send_replace(true);
        self.drain_channels();
        if !was_running {
            // A running sync resets the queue itself on the way out.
            self.queue.lock().reset();
        }
        true
    }

    /// Discard anything sitting in the delivery channels without blocking.
    fn drain_channels(&self) {
        if let Ok(mut rx) = self.hash_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
        if let Ok(mut rx) = self.block_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }

    // -------------------------------------------------------------------------
    // Phase 1: hash backfill
    // -------------------------------------------------------------------------

    /// Walk hashes back from `head` until a locally-known ancestor appears.
    ///
    /// Single active peer at a time; a stalled peer is swapped for any
    /// not-yet-attempted peer whose claimed head the queue has already
    /// seen. Late batches from a previous active peer are discarded by the
    /// sender-id check.
    async fn fetch_hashes(&self, origin: Arc<Peer>, head: Hash256) -> Result<(), SyncError> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        // A cancel racing the sync start is already latched in the channel.
        if *cancel_rx.borrow_and_update() {
            return Err(SyncError::HashFetchCancelled);
        }
        let mut hash_rx = self.hash_rx.lock().await;

        let mut active = origin;
        let mut attempted: HashSet<String> = HashSet::new();
        attempted.insert(active.id().to_string());
        let mut last_hash = head;

        self.queue.lock().insert(&[head]);
        if let Err(e) = active.request_hashes(head) {
            // Let the TTL rotate us onto another peer.
            debug!(peer = active.id(), error = %e, "sync: hash request refused");
        }
        let mut deadline = time::Instant::now() + self.config.hash_ttl;

        loop {
            tokio::select! {
                biased;

                changed = cancel_rx.changed() => {
                    if changed.is_ok() && *cancel_rx.borrow_and_update() {
                        return Err(SyncError::HashFetchCancelled);
                    }
                }

                delivery = hash_rx.recv() => {
                    let Some(HashDelivery { peer_id, hashes }) = delivery else {
                        return Err(SyncError::HashFetchCancelled);
                    };
                    if peer_id != active.id() {
                        debug!(peer = %peer_id, "sync: stale hash batch discarded");
                        continue;
                    }
                    deadline = time::Instant::now() + self.config.hash_ttl;

                    if hashes.is_empty() {
                        return Err(SyncError::EmptyHashSet);
                    }

                    // Truncate at the first hash we can anchor on.
                    let mut anchor = None;
                    let mut accept = hashes.len();
                    for (i, hash) in hashes.iter().enumerate() {
                        if self.chain.has_block(hash) || self.queue.lock().has(hash) {
                            anchor = Some(*hash);
                            accept = i;
                            break;
                        }
                    }
                    let inserted = self.queue.lock().insert(&hashes[..accept]);
                    debug!(
                        peer = active.id(),
                        received = hashes.len(),
                        inserted,
                        "sync: hash batch"
                    );

                    match anchor {
                        Some(ancestor) => {
                            let offset = self
                                .chain
                                .get_block(&ancestor)
                                .map(|b| b.number() + 1)
                                .unwrap_or(0);
                            let pending = {
                                let mut queue = self.queue.lock();
                                queue.alloc(offset);
                                queue.pending()
                            };
                            info!(
                                ancestor = %ancestor.short(),
                                offset,
                                pending,
                                "sync: hash backfill complete"
                            );
                            return Ok(());
                        }
                        None => {
                            last_hash = *hashes.last().unwrap();
                            if let Err(e) = active.request_hashes(last_hash) {
                                debug!(peer = active.id(), error = %e, "sync: hash request refused");
                            }
                        }
                    }
                }

                _ = time::sleep_until(deadline) => {
                    warn!(peer = active.id(), "sync: hash fetch stalled, rotating peer");
                    let replacement = self.peers.all_peers().into_iter().find(|p| {
                        !attempted.contains(p.id()) && self.queue.lock().has(&p.head())
                    });
                    match replacement {
                        Some(peer) if !last_hash.is_zero() => {
                            attempted.insert(peer.id().to_string());
                            active = peer;
                            info!(peer = active.id(), from = %last_hash.short(), "sync: hash fetch failover");
                            if let Err(e) = active.request_hashes(last_hash) {
                                debug!(peer = active.id(), error = %e, "sync: hash request refused");
                            }
                            deadline = time::Instant::now() + self.config.hash_ttl;
                        }
                        _ => return Err(SyncError::Timeout),
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Phase 2: parallel block download
    // -------------------------------------------------------------------------

    /// Fan block reservations out to idle peers until nothing is pending
    /// and nothing is in flight.
    async fn fetch_blocks(&self) -> Result<(), SyncError> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        if *cancel_rx.borrow_and_update() {
            return Err(SyncError::BlockFetchCancelled);
        }
        let mut block_rx = self.block_rx.lock().await;
        let mut ticker = time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = cancel_rx.changed() => {
                    if changed.is_ok() && *cancel_rx.borrow_and_update() {
                        return Err(SyncError::BlockFetchCancelled);
                    }
                }

                delivery = block_rx.recv() => {
                    let Some(BlockDelivery { peer_id, blocks }) = delivery else {
                        return Err(SyncError::BlockFetchCancelled);
                    };
                    // The peer may have unregistered mid-flight.
                    let Some(peer) = self.peers.peer(&peer_id) else {
                        debug!(peer = %peer_id, "sync: delivery from unknown peer ignored");
                        continue;
                    };
                    let count = blocks.len();
                    match self.queue.lock().deliver(&peer_id, blocks) {
                        Ok(()) => {
                            peer.promote();
                            peer.set_idle(true);
                            debug!(peer = %peer_id, count, "sync: delivery accepted");
                        }
                        Err(e) => {
                            debug!(peer = %peer_id, error = %e, "sync: delivery rejected");
                            self.peers.demote(&peer_id);
                        }
                    }
                }

                _ = ticker.tick() => {
                    if self.dispatch_tick()? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One scheduling tick: expire stragglers, check completion, dispatch
    /// reservations. Returns `Ok(true)` once the download is complete.
    fn dispatch_tick(&self) -> Result<bool, SyncError> {
        let expired = self.queue.lock().expire(self.config.block_ttl);
        for id in &expired {
            warn!(peer = %id, "sync: block reservation expired");
            if let Some(peer) = self.peers.peer(id) {
                peer.set_idle(true);
            }
            self.peers.demote(id);
        }

        if self.peers.is_empty() {
            return Err(SyncError::NoPeers);
        }

        {
            let queue = self.queue.lock();
            if queue.pending() == 0 && queue.in_flight() == 0 {
                return Ok(true);
            }
            if queue.throttle() {
                return Ok(false);
            }
        }

        let mut dispatched = false;
        for peer in self.peers.idle_peers() {
            let request = {
                let mut queue = self.queue.lock();
                if queue.throttle() {
                    break;
                }
                queue.reserve(peer.id(), self.config.max_block_fetch)
            };
            let Some(request) = request else { continue };

            match peer.fetch(&request) {
                Ok(()) => {
                    dispatched = true;
                    debug!(peer = peer.id(), count = request.hashes.len(), "sync: blocks requested");
                }
                Err(e) => {
                    debug!(peer = peer.id(), error = %e, "sync: block request refused");
                    self.queue.lock().cancel(&request);
                }
            }
        }

        if !dispatched && self.queue.lock().in_flight() == 0 {
            return Err(SyncError::PeersUnavailable);
        }
        Ok(false)
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (pending, cached) = self.stats();
        f.debug_struct("Downloader")
            .field("peers", &self.peer_count())
            .field("synchronising", &self.is_synchronising())
            .field("pending", &pending)
            .field("cached", &cached)
            .finish()
    }
}
