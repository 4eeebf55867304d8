//! Download scheduler: hash pool, reservations and the chain-ordered cache.
//!
//! The queue receives hashes in the order the backfill walks them
//! (tip towards genesis) and hands them out to peers chain-oldest-first in
//! bounded chunks. Delivered blocks are validated against the reservation
//! that covers them, slotted into a chain-ordered cache, and drained by the
//! consumer as a contiguous prefix. Nothing here blocks; the orchestrator
//! serialises access behind a single lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use strand_core::error::DeliveryError;
use strand_core::types::{Block, Hash256};
use tracing::debug;

/// A chunk of hashes reserved by one peer for block retrieval.
///
/// `hashes` are in chain order, oldest first, ready to be forwarded to the
/// peer's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    /// The peer holding the reservation.
    pub peer_id: String,
    /// The reserved hashes, chain-oldest first.
    pub hashes: Vec<Hash256>,
}

/// One peer's outstanding reservation.
struct Reservation {
    /// Reserved hashes with their insertion positions.
    hashes: HashMap<Hash256, usize>,
    /// When the reservation was handed out.
    created: Instant,
}

/// Scheduler state for one synchronisation run.
///
/// Insertion position `p` maps to chain position `total - 1 - p` once
/// [`alloc`](Self::alloc) has fixed the download window, because hashes
/// arrive tip-to-genesis and blocks are surfaced oldest-first.
pub struct BlockQueue {
    /// Every hash seen this run, in insertion order.
    order: Vec<Hash256>,
    /// Hash → insertion position, for membership and position lookups.
    index: HashMap<Hash256, usize>,
    /// Unreserved, undelivered hashes keyed by insertion position.
    free: BTreeMap<usize, Hash256>,
    /// Outstanding reservations keyed by peer id.
    reservations: HashMap<String, Reservation>,
    /// Chain-ordered slots for delivered blocks, sized at [`alloc`](Self::alloc).
    cache: Vec<Option<Block>>,
    /// Block number of chain position 0.
    cache_offset: u64,
    /// Number of hashes when the window was fixed; the cache length.
    total: usize,
    /// Length of the already-drained cache prefix.
    taken: usize,
    /// Delivered blocks not yet drained.
    cached: usize,
    /// Undrained-block count at which [`throttle`](Self::throttle) trips.
    cache_limit: usize,
}

impl BlockQueue {
    /// Create an empty queue with the given throttle high-water mark.
    pub fn new(cache_limit: usize) -> Self {
        Self {
            order: Vec::new(),
            index: HashMap::new(),
            free: BTreeMap::new(),
            reservations: HashMap::new(),
            cache: Vec::new(),
            cache_offset: 0,
            total: 0,
            taken: 0,
            cached: 0,
            cache_limit,
        }
    }

    /// Append hashes to the pool in arrival order, skipping any hash the
    /// queue has already seen this run. Returns the number inserted.
    pub fn insert(&mut self, hashes: &[Hash256]) -> usize {
        let mut inserted = 0;
        for &hash in hashes {
            if self.index.contains_key(&hash) {
                continue;
            }
            let pos = self.order.len();
            self.order.push(hash);
            self.index.insert(hash, pos);
            self.free.insert(pos, hash);
            inserted += 1;
        }
        inserted
    }

    /// Whether the queue has seen this hash during the current run.
    pub fn has(&self, hash: &Hash256) -> bool {
        self.index.contains_key(hash)
    }

    /// Hashes awaiting delivery (unreserved plus reserved).
    pub fn pending(&self) -> usize {
        self.free.len() + self.in_flight()
    }

    /// Hashes currently reserved across all peers.
    pub fn in_flight(&self) -> usize {
        self.reservations.values().map(|r| r.hashes.len()).sum()
    }

    /// `(pending hashes, cached blocks)`.
    pub fn size(&self) -> (usize, usize) {
        (self.pending(), self.cached)
    }

    /// Fix the download window at the hash→block transition.
    ///
    /// `offset` is the block number of the oldest pending hash. Sizes the
    /// chain-ordered cache to hold every hash inserted so far.
    pub fn alloc(&mut self, offset: u64) {
        self.total = self.order.len();
        self.cache = vec![None; self.total];
        self.cache_offset = offset;
        self.taken = 0;
        self.cached = 0;
    }

    /// Reserve up to `n` unreserved hashes for `peer_id`, chain-oldest
    /// first.
    ///
    /// Returns `None` when the pool has nothing unreserved or the peer
    /// already holds a reservation; a peer gets at most one at a time.
    pub fn reserve(&mut self, peer_id: &str, n: usize) -> Option<BlockRequest> {
        if n == 0 || self.reservations.contains_key(peer_id) || self.free.is_empty() {
            return None;
        }

        // Highest insertion position = deepest ancestor = oldest block.
        let mut hashes = Vec::new();
        let mut positions = HashMap::new();
        while hashes.len() < n {
            let Some((pos, hash)) = self.free.pop_last() else {
                break;
            };
            positions.insert(hash, pos);
            hashes.push(hash);
        }

        self.reservations.insert(
            peer_id.to_string(),
            Reservation {
                hashes: positions,
                created: Instant::now(),
            },
        );
        Some(BlockRequest {
            peer_id: peer_id.to_string(),
            hashes,
        })
    }

    /// Validate and accept a block delivery from `peer_id`.
    ///
    /// Any non-empty subset of the peer's reservation is accepted; the
    /// undelivered remainder returns to the pool and the reservation is
    /// cleared. A block outside the reservation, a duplicate within the
    /// delivery, or a hash/number/parent mismatch rejects the whole
    /// delivery and leaves the reservation in place for the caller to act
    /// on.
    pub fn deliver(&mut self, peer_id: &str, blocks: Vec<Block>) -> Result<(), DeliveryError> {
        let reservation = self
            .reservations
            .get(peer_id)
            .ok_or_else(|| DeliveryError::NoReservation(peer_id.to_string()))?;
        if blocks.is_empty() {
            return Err(DeliveryError::EmptyDelivery);
        }

        // Validate everything before touching any state.
        let mut seen = HashSet::new();
        for block in &blocks {
            let hash = block.hash();
            let &pos = reservation
                .hashes
                .get(&hash)
                .ok_or_else(|| DeliveryError::NotRequested(hash.to_string()))?;
            if !seen.insert(hash) {
                return Err(DeliveryError::DuplicateBlock(hash.to_string()));
            }
            // Hashes reserved outside the allocated window cannot be placed.
            let chain_pos = self
                .total
                .checked_sub(1 + pos)
                .ok_or_else(|| DeliveryError::NotRequested(hash.to_string()))?;
            let expected = self.cache_offset + chain_pos as u64;
            if block.number() != expected {
                return Err(DeliveryError::NumberMismatch {
                    got: block.number(),
                    expected,
                });
            }
            // The predecessor in insertion order is the parent, except for
            // the deepest hash whose parent is the backfill anchor.
            if pos + 1 < self.total && block.parent_hash() != self.order[pos + 1] {
                return Err(DeliveryError::ParentMismatch(hash.to_string()));
            }
        }

        let mut reservation = self.reservations.remove(peer_id).unwrap();
        let delivered = blocks.len();
        for block in blocks {
            let pos = reservation.hashes.remove(&block.hash()).unwrap();
            let chain_pos = self.total - 1 - pos;
            self.cache[chain_pos] = Some(block);
            self.cached += 1;
        }
        // Partial delivery: the rest goes back to the pool.
        for (hash, pos) in reservation.hashes {
            self.free.insert(pos, hash);
        }
        debug!(peer = peer_id, delivered, cached = self.cached, "sync: blocks accepted");
        Ok(())
    }

    /// Return a dispatched-but-refused reservation to the pool.
    pub fn cancel(&mut self, request: &BlockRequest) {
        if let Some(reservation) = self.reservations.remove(&request.peer_id) {
            for (hash, pos) in reservation.hashes {
                self.free.insert(pos, hash);
            }
        }
    }

    /// Release reservations older than `ttl` and return their holders.
    pub fn expire(&mut self, ttl: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .reservations
            .iter()
            .filter(|(_, r)| r.created.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            let reservation = self.reservations.remove(id).unwrap();
            debug!(peer = %id, hashes = reservation.hashes.len(), "sync: reservation expired");
            for (hash, pos) in reservation.hashes {
                self.free.insert(pos, hash);
            }
        }
        expired
    }

    /// Whether dispatch should pause until the consumer drains.
    pub fn throttle(&self) -> bool {
        self.cached >= self.cache_limit
    }

    /// Delivered block for `hash`, if it is still cached.
    pub fn get_block(&self, hash: &Hash256) -> Option<&Block> {
        let &pos = self.index.get(hash)?;
        let chain_pos = self.total.checked_sub(1 + pos)?;
        self.cache.get(chain_pos)?.as_ref()
    }

    /// The block at the head of the undrained cache prefix, if delivered.
    pub fn head_block(&self) -> Option<&Block> {
        self.cache.get(self.taken)?.as_ref()
    }

    /// Drain the longest contiguous chain-ordered prefix of delivered
    /// blocks. Drained blocks are forgotten.
    pub fn take_blocks(&mut self) -> Vec<Block> {
        let mut out = Vec::new();
        while let Some(slot) = self.cache.get_mut(self.taken) {
            match slot.take() {
                Some(block) => {
                    out.push(block);
                    self.taken += 1;
                    self.cached -= 1;
                }
                None => break,
            }
        }
        out
    }

    /// Discard all state from the current run.
    pub fn reset(&mut self) {
        self.order.clear();
        self.index.clear();
        self.free.clear();
        self.reservations.clear();
        self.cache.clear();
        self.cache_offset = 0;
        self.total = 0;
        self.taken = 0;
        self.cached = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::types::BlockHeader;

    const CACHE_LIMIT: usize = 1024;

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Build a linked chain of `n` blocks, numbers `offset..offset + n`.
    fn make_chain(n: usize, offset: u64, parent: Hash256) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(n);
        let mut parent_hash = parent;
        for i in 0..n {
            let block = Block {
                header: BlockHeader {
                    version: 1,
                    parent_hash,
                    number: offset + i as u64,
                    timestamp: offset + i as u64,
                    payload_root: Hash256::ZERO,
                },
                payload: vec![],
            };
            parent_hash = block.hash();
            blocks.push(block);
        }
        blocks
    }

    /// Insert a chain's hashes the way the backfill does (tip to genesis)
    /// and fix the window. Returns the queue and the chain, oldest first.
    fn loaded_queue(n: usize, offset: u64) -> (BlockQueue, Vec<Block>) {
        let chain = make_chain(n, offset, Hash256([0xEE; 32]));
        let mut queue = BlockQueue::new(CACHE_LIMIT);
        let tip_first: Vec<Hash256> = chain.iter().rev().map(|b| b.hash()).collect();
        queue.insert(&tip_first);
        queue.alloc(offset);
        (queue, chain)
    }

    fn blocks_for(chain: &[Block], hashes: &[Hash256]) -> Vec<Block> {
        hashes
            .iter()
            .map(|h| chain.iter().find(|b| b.hash() == *h).unwrap().clone())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Insert / membership
    // -------------------------------------------------------------------------

    /// Inserting a known hash again is a no-op.
    #[test]
    fn insert_is_idempotent() {
        let mut queue = BlockQueue::new(CACHE_LIMIT);
        let h = Hash256([1; 32]);

        assert_eq!(queue.insert(&[h]), 1);
        assert_eq!(queue.insert(&[h]), 0);
        assert_eq!(queue.pending(), 1);
        assert!(queue.has(&h));
    }

    /// A reserved hash stays pending and cannot be inserted twice.
    #[test]
    fn insert_ignores_reserved_hash() {
        let (mut queue, _) = loaded_queue(3, 0);
        let req = queue.reserve("a", 3).unwrap();

        assert_eq!(queue.insert(&req.hashes), 0);
        assert_eq!(queue.pending(), 3);
    }

    // -------------------------------------------------------------------------
    // Reservation
    // -------------------------------------------------------------------------

    /// Reservations hand out hashes chain-oldest first.
    #[test]
    fn reserve_is_oldest_first() {
        let (mut queue, chain) = loaded_queue(5, 10);
        let req = queue.reserve("a", 2).unwrap();

        assert_eq!(req.hashes, vec![chain[0].hash(), chain[1].hash()]);

        let req2 = queue.reserve("b", 2).unwrap();
        assert_eq!(req2.hashes, vec![chain[2].hash(), chain[3].hash()]);
    }

    /// A peer holds at most one reservation at a time.
    #[test]
    fn reserve_is_exclusive_per_peer() {
        let (mut queue, _) = loaded_queue(10, 0);

        assert!(queue.reserve("a", 2).is_some());
        assert!(queue.reserve("a", 2).is_none());
        assert_eq!(queue.in_flight(), 2);
    }

    /// Chunks are capped at the requested size and at pool exhaustion.
    #[test]
    fn reserve_caps_chunk() {
        let (mut queue, _) = loaded_queue(3, 0);

        let req = queue.reserve("a", 128).unwrap();
        assert_eq!(req.hashes.len(), 3);
        assert!(queue.reserve("b", 1).is_none(), "pool is exhausted");
    }

    /// Two peers never reserve the same hash.
    #[test]
    fn reservations_are_disjoint() {
        let (mut queue, _) = loaded_queue(8, 0);
        let a = queue.reserve("a", 5).unwrap();
        let b = queue.reserve("b", 5).unwrap();

        for h in &b.hashes {
            assert!(!a.hashes.contains(h));
        }
        assert_eq!(a.hashes.len() + b.hashes.len(), 8);
    }

    // -------------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------------

    /// A full delivery fills the cache and clears the reservation.
    #[test]
    fn deliver_full_reservation() {
        let (mut queue, chain) = loaded_queue(4, 7);
        let req = queue.reserve("a", 4).unwrap();

        queue.deliver("a", blocks_for(&chain, &req.hashes)).unwrap();

        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.size(), (0, 4));
    }

    /// A subset delivery keeps only the delivered hashes; the remainder
    /// returns to the pool for someone else.
    #[test]
    fn deliver_subset_releases_remainder() {
        let (mut queue, chain) = loaded_queue(4, 0);
        let req = queue.reserve("a", 4).unwrap();

        let partial = blocks_for(&chain, &req.hashes[..2]);
        queue.deliver("a", partial).unwrap();

        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.pending(), 2);

        // The remainder is reservable again, still oldest-first.
        let req2 = queue.reserve("b", 4).unwrap();
        assert_eq!(req2.hashes, req.hashes[2..].to_vec());
    }

    /// A delivery from a peer without a reservation is rejected.
    #[test]
    fn deliver_without_reservation() {
        let (mut queue, chain) = loaded_queue(2, 0);
        let err = queue.deliver("ghost", vec![chain[0].clone()]).unwrap_err();
        assert_eq!(err, DeliveryError::NoReservation("ghost".to_string()));
    }

    /// An unsolicited block rejects the whole delivery and leaves the
    /// reservation intact.
    #[test]
    fn deliver_rejects_unsolicited_block() {
        let (mut queue, chain) = loaded_queue(4, 0);
        let req = queue.reserve("a", 2).unwrap();

        // chain[3] was never reserved by "a".
        let mut blocks = blocks_for(&chain, &req.hashes);
        blocks.push(chain[3].clone());

        let err = queue.deliver("a", blocks).unwrap_err();
        assert!(matches!(err, DeliveryError::NotRequested(_)));
        assert_eq!(queue.in_flight(), 2, "reservation must survive a bad delivery");
    }

    /// A forged block number changes the hash, so the block no longer
    /// matches any reserved hash.
    #[test]
    fn deliver_rejects_forged_number() {
        let (mut queue, chain) = loaded_queue(3, 5);
        let req = queue.reserve("a", 3).unwrap();

        let mut blocks = blocks_for(&chain, &req.hashes);
        blocks[1].header.number += 1;

        let err = queue.deliver("a", blocks).unwrap_err();
        assert!(matches!(err, DeliveryError::NotRequested(_)));
        assert_eq!(queue.in_flight(), 3);
    }

    /// If the backfill was fed a lying hash sequence, honest blocks land on
    /// the wrong chain position and are rejected by the number check.
    #[test]
    fn deliver_rejects_misordered_window() {
        let chain = make_chain(3, 0, Hash256([0xEE; 32]));
        let mut queue = BlockQueue::new(CACHE_LIMIT);
        // Genesis-first instead of tip-first: every position is wrong.
        let genesis_first: Vec<Hash256> = chain.iter().map(|b| b.hash()).collect();
        queue.insert(&genesis_first);
        queue.alloc(0);
        let req = queue.reserve("a", 3).unwrap();

        let err = queue.deliver("a", blocks_for(&chain, &req.hashes)).unwrap_err();
        assert!(matches!(err, DeliveryError::NumberMismatch { .. }));
        assert_eq!(queue.in_flight(), 3);
    }

    /// A backfill sequence of real hashes that do not actually chain to
    /// each other passes the hash and number checks but fails the parent
    /// check against the predecessor in the window.
    #[test]
    fn deliver_rejects_unchained_sequence() {
        let ours = make_chain(3, 0, Hash256([0xEE; 32]));
        let theirs = make_chain(2, 0, Hash256([0xDD; 32]));

        // A window claiming chain [ours[0], theirs[1], ours[2]]: every
        // entry is a real block at the right height, but theirs[1] does
        // not descend from ours[0].
        let mut queue = BlockQueue::new(CACHE_LIMIT);
        queue.insert(&[ours[2].hash(), theirs[1].hash(), ours[0].hash()]);
        queue.alloc(0);
        let req = queue.reserve("a", 3).unwrap();
        assert_eq!(
            req.hashes,
            vec![ours[0].hash(), theirs[1].hash(), ours[2].hash()]
        );

        let err = queue
            .deliver(
                "a",
                vec![ours[0].clone(), theirs[1].clone(), ours[2].clone()],
            )
            .unwrap_err();
        assert!(matches!(err, DeliveryError::ParentMismatch(_)));
        assert_eq!(queue.in_flight(), 3, "reservation must survive a bad delivery");
    }

    /// The same block twice in one delivery is rejected.
    #[test]
    fn deliver_rejects_duplicate() {
        let (mut queue, chain) = loaded_queue(2, 0);
        let req = queue.reserve("a", 2).unwrap();

        let blocks = vec![
            blocks_for(&chain, &req.hashes)[0].clone(),
            blocks_for(&chain, &req.hashes)[0].clone(),
        ];
        let err = queue.deliver("a", blocks).unwrap_err();
        assert!(matches!(err, DeliveryError::DuplicateBlock(_)));
    }

    /// An empty delivery is rejected, not silently promoted.
    #[test]
    fn deliver_rejects_empty() {
        let (mut queue, _) = loaded_queue(2, 0);
        queue.reserve("a", 2).unwrap();

        assert_eq!(queue.deliver("a", vec![]).unwrap_err(), DeliveryError::EmptyDelivery);
    }

    // -------------------------------------------------------------------------
    // Cancel / expire
    // -------------------------------------------------------------------------

    /// Cancelling a refused request returns its hashes to the pool.
    #[test]
    fn cancel_returns_hashes() {
        let (mut queue, _) = loaded_queue(3, 0);
        let req = queue.reserve("a", 3).unwrap();

        queue.cancel(&req);

        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.pending(), 3);
        let again = queue.reserve("a", 3).unwrap();
        assert_eq!(again.hashes, req.hashes);
    }

    /// Stale reservations expire back to the pool, naming their holders.
    #[test]
    fn expire_releases_stragglers() {
        let (mut queue, _) = loaded_queue(4, 0);
        queue.reserve("slow", 2).unwrap();

        let expired = queue.expire(Duration::ZERO);
        assert_eq!(expired, vec!["slow".to_string()]);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.pending(), 4);
    }

    /// Fresh reservations survive an expiry sweep.
    #[test]
    fn expire_spares_fresh_reservations() {
        let (mut queue, _) = loaded_queue(4, 0);
        queue.reserve("fresh", 2).unwrap();

        let expired = queue.expire(Duration::from_secs(3600));
        assert!(expired.is_empty());
        assert_eq!(queue.in_flight(), 2);
    }

    // -------------------------------------------------------------------------
    // Throttle / take
    // -------------------------------------------------------------------------

    /// The throttle trips at the configured undrained-block mark and
    /// releases once the consumer drains.
    #[test]
    fn throttle_follows_cache_level() {
        let chain = make_chain(3, 0, Hash256([0xEE; 32]));
        let mut queue = BlockQueue::new(2);
        let tip_first: Vec<Hash256> = chain.iter().rev().map(|b| b.hash()).collect();
        queue.insert(&tip_first);
        queue.alloc(0);

        assert!(!queue.throttle());

        let req = queue.reserve("a", 2).unwrap();
        queue.deliver("a", blocks_for(&chain, &req.hashes)).unwrap();
        assert!(queue.throttle());

        queue.take_blocks();
        assert!(!queue.throttle());
    }

    /// take_blocks drains only the contiguous delivered prefix, in chain
    /// order.
    #[test]
    fn take_blocks_is_prefix_ordered() {
        let (mut queue, chain) = loaded_queue(5, 3);
        let first = queue.reserve("a", 2).unwrap();
        let rest = queue.reserve("b", 3).unwrap();

        // Deliver the later chunk first: nothing is takeable yet.
        queue.deliver("b", blocks_for(&chain, &rest.hashes)).unwrap();
        assert!(queue.head_block().is_none());
        assert!(queue.take_blocks().is_empty());

        // The head chunk arrives and the whole run drains in order.
        queue.deliver("a", blocks_for(&chain, &first.hashes)).unwrap();
        assert_eq!(queue.head_block().unwrap().number(), 3);

        let taken = queue.take_blocks();
        assert_eq!(taken.len(), 5);
        for (i, block) in taken.iter().enumerate() {
            assert_eq!(block.number(), 3 + i as u64);
        }
        for pair in taken.windows(2) {
            assert_eq!(pair[1].parent_hash(), pair[0].hash());
        }
        assert_eq!(queue.size(), (0, 0));
    }

    /// Drained blocks are forgotten; a second take returns nothing.
    #[test]
    fn take_blocks_forgets() {
        let (mut queue, chain) = loaded_queue(2, 0);
        let req = queue.reserve("a", 2).unwrap();
        queue.deliver("a", blocks_for(&chain, &req.hashes)).unwrap();

        assert_eq!(queue.take_blocks().len(), 2);
        assert!(queue.take_blocks().is_empty());
        assert!(queue.get_block(&chain[0].hash()).is_none());
    }

    /// get_block finds cached blocks by hash.
    #[test]
    fn get_block_by_hash() {
        let (mut queue, chain) = loaded_queue(3, 0);
        let req = queue.reserve("a", 3).unwrap();
        queue.deliver("a", blocks_for(&chain, &req.hashes)).unwrap();

        let found = queue.get_block(&chain[1].hash()).unwrap();
        assert_eq!(found.number(), 1);
        assert!(queue.get_block(&Hash256([0x77; 32])).is_none());
    }

    /// reset discards everything.
    #[test]
    fn reset_clears_all_state() {
        let (mut queue, chain) = loaded_queue(4, 0);
        let req = queue.reserve("a", 2).unwrap();
        queue.deliver("a", blocks_for(&chain, &req.hashes)).unwrap();

        queue.reset();

        assert_eq!(queue.size(), (0, 0));
        assert_eq!(queue.in_flight(), 0);
        assert!(!queue.has(&chain[0].hash()));
        assert!(queue.head_block().is_none());
    }

    // -------------------------------------------------------------------------
    // Properties
    // -------------------------------------------------------------------------

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Whatever order reservations are delivered in, the consumer
            /// drains the full chain strictly in order.
            #[test]
            fn drains_in_chain_order(
                n in 1usize..40,
                offset in 0u64..1000,
                chunk in 1usize..8,
                seed in any::<u64>(),
            ) {
                let (mut queue, chain) = loaded_queue(n, offset);

                let mut requests = Vec::new();
                let mut peer = 0;
                loop {
                    let id = format!("p{peer}");
                    let Some(req) = queue.reserve(&id, chunk) else { break };
                    requests.push(req);
                    peer += 1;
                }
                prop_assert_eq!(queue.in_flight(), n);

                // Deterministic shuffle of delivery order from the seed.
                let mut order: Vec<usize> = (0..requests.len()).collect();
                let mut state = seed | 1;
                for i in (1..order.len()).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    order.swap(i, (state as usize) % (i + 1));
                }

                for &i in &order {
                    let req = &requests[i];
                    queue.deliver(&req.peer_id, blocks_for(&chain, &req.hashes)).unwrap();
                }

                let taken = queue.take_blocks();
                prop_assert_eq!(taken.len(), n);
                for (i, block) in taken.iter().enumerate() {
                    prop_assert_eq!(block.number(), offset + i as u64);
                }
                prop_assert_eq!(queue.size(), (0, 0));
            }

            /// Reservation chunks partition the pool: disjoint, complete,
            /// each within the requested size.
            #[test]
            fn reservations_partition_pool(n in 1usize..60, chunk in 1usize..10) {
                let (mut queue, _) = loaded_queue(n, 0);

                let mut seen = HashSet::new();
                let mut peer = 0;
                loop {
                    let id = format!("p{peer}");
                    let Some(req) = queue.reserve(&id, chunk) else { break };
                    prop_assert!(req.hashes.len() <= chunk);
                    for h in &req.hashes {
                        prop_assert!(seen.insert(*h), "hash reserved twice");
                    }
                    peer += 1;
                }
                prop_assert_eq!(seen.len(), n);
            }
        }
    }
}
