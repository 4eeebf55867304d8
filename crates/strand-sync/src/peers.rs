//! Peer handles and the registered-peer set.
//!
//! Each [`Peer`] couples a remote peer's identity and claimed head with its
//! outbound [`FetchTransport`], an idle flag and an integer reputation.
//! Reputation moves up on useful deliveries and down on timeouts or invalid
//! data; a peer that sinks below [`REP_FLOOR`] is evicted from the
//! [`PeerSet`].

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use strand_core::error::{FetchError, PeerSetError};
use strand_core::traits::FetchTransport;
use strand_core::types::Hash256;
use tracing::{debug, warn};

use crate::queue::BlockRequest;

/// Reputation cap; rewards saturate here.
pub const REP_CEILING: i32 = 100;
/// Reputation floor; a demotion below this evicts the peer.
pub const REP_FLOOR: i32 = -10;

/// Handle to one registered remote peer.
pub struct Peer {
    id: String,
    head: Hash256,
    transport: Arc<dyn FetchTransport>,
    /// True iff the peer currently holds no block reservation.
    idle: AtomicBool,
    rep: AtomicI32,
}

impl Peer {
    /// Create a peer handle. Peers start idle with neutral reputation.
    pub fn new(id: impl Into<String>, head: Hash256, transport: Arc<dyn FetchTransport>) -> Self {
        Self {
            id: id.into(),
            head,
            transport,
            idle: AtomicBool::new(true),
            rep: AtomicI32::new(0),
        }
    }

    /// The peer's unique id within its set.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The head hash the peer claimed at registration.
    pub fn head(&self) -> Hash256 {
        self.head
    }

    /// Whether the peer currently holds no reservation.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Mark the peer idle or busy.
    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }

    /// Current reputation score.
    pub fn rep(&self) -> i32 {
        self.rep.load(Ordering::Acquire)
    }

    /// Raise reputation by one, saturating at [`REP_CEILING`].
    pub fn promote(&self) -> i32 {
        let prev = self
            .rep
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some((r + 1).min(REP_CEILING))
            })
            .unwrap_or(REP_CEILING);
        (prev + 1).min(REP_CEILING)
    }

    /// Lower reputation by one. Returns the new score.
    pub fn demote(&self) -> i32 {
        self.rep.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Ask the peer for ancestor hashes walking back from `from`.
    ///
    /// The hash phase is single-peer, so no idle gate applies here.
    pub fn request_hashes(&self, from: Hash256) -> Result<(), FetchError> {
        self.transport.request_hashes(from)
    }

    /// Dispatch a block request for an accepted reservation.
    ///
    /// Flips the idle flag busy-ward first; a concurrent holder makes this
    /// fail with [`FetchError::NotIdle`] and the caller must return the
    /// reservation to the queue. A transport refusal restores the idle flag.
    pub fn fetch(&self, request: &BlockRequest) -> Result<(), FetchError> {
        if self
            .idle
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FetchError::NotIdle);
        }
        if let Err(e) = self.transport.request_blocks(&request.hashes) {
            self.idle.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("head", &self.head.short())
            .field("idle", &self.is_idle())
            .field("rep", &self.rep())
            .finish()
    }
}

/// The set of registered peers, keyed by id.
pub struct PeerSet {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl PeerSet {
    /// Create an empty peer set.
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a peer. Fails if the id is already present.
    pub fn register(&self, peer: Peer) -> Result<(), PeerSetError> {
        let mut peers = self.peers.write();
        if peers.contains_key(peer.id()) {
            return Err(PeerSetError::AlreadyRegistered(peer.id().to_string()));
        }
        debug!(peer = peer.id(), head = %peer.head().short(), "sync: peer registered");
        peers.insert(peer.id().to_string(), Arc::new(peer));
        Ok(())
    }

    /// Remove a peer. Fails if the id is absent.
    pub fn unregister(&self, id: &str) -> Result<(), PeerSetError> {
        match self.peers.write().remove(id) {
            Some(_) => {
                debug!(peer = id, "sync: peer unregistered");
                Ok(())
            }
            None => Err(PeerSetError::UnknownPeer(id.to_string())),
        }
    }

    /// Look up a peer by id.
    pub fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    /// Snapshot of all registered peers.
    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    /// Snapshot of currently idle peers, shuffled so that repeated dispatch
    /// does not starve latecomers.
    pub fn idle_peers(&self) -> Vec<Arc<Peer>> {
        let mut idle: Vec<Arc<Peer>> = self
            .peers
            .read()
            .values()
            .filter(|p| p.is_idle())
            .cloned()
            .collect();
        idle.shuffle(&mut rand::thread_rng());
        idle
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether the set holds no peers.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Clear idle flags back to idle for every peer.
    ///
    /// Membership and reputation survive; this runs at the start of each
    /// synchronisation so stale reservation state cannot leak across runs.
    pub fn reset(&self) {
        for peer in self.peers.read().values() {
            peer.set_idle(true);
        }
    }

    /// Raise a peer's reputation.
    pub fn promote(&self, id: &str) {
        if let Some(peer) = self.peer(id) {
            peer.promote();
        }
    }

    /// Lower a peer's reputation, evicting it below [`REP_FLOOR`].
    ///
    /// Returns `true` if the peer was evicted.
    pub fn demote(&self, id: &str) -> bool {
        let Some(peer) = self.peer(id) else {
            return false;
        };
        let rep = peer.demote();
        if rep < REP_FLOOR {
            self.peers.write().remove(id);
            warn!(peer = id, rep, "sync: peer evicted on low reputation");
            return true;
        }
        false
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}
