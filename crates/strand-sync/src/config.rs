//! Configuration for the sync engine.

use std::time::Duration;

/// Default cap on the number of blocks requested in one reservation.
pub const MAX_BLOCK_FETCH: usize = 128;
/// Default advisory cap on the number of hashes a peer returns per batch.
pub const MAX_HASH_FETCH: usize = 512;

/// Tunable parameters of a [`Downloader`](crate::Downloader).
///
/// `min_desired_peer_count` and `peer_count_timeout` are carried for a
/// caller-side admission gate (refuse to begin syncing until enough peers
/// are known, or the timeout elapses); the engine itself does not consume
/// them.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum blocks per reservation handed to a single peer.
    pub max_block_fetch: usize,
    /// Advisory cap on hashes per backfill reply; transport
    /// implementations size their batches to it.
    pub max_hash_fetch: usize,
    /// How long to wait for a hash batch before failing over to another peer.
    pub hash_ttl: Duration,
    /// How long a block reservation may stay outstanding before expiry.
    pub block_ttl: Duration,
    /// Interval of the block-phase scheduling tick.
    pub tick_interval: Duration,
    /// Undrained-block high-water mark at which dispatch is throttled.
    pub block_cache_limit: usize,
    /// Minimum peers a caller-side gate should wait for before syncing.
    pub min_desired_peer_count: usize,
    /// How long a caller-side gate should wait for the desired peer count.
    pub peer_count_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_block_fetch: MAX_BLOCK_FETCH,
            max_hash_fetch: MAX_HASH_FETCH,
            hash_ttl: Duration::from_secs(20),
            block_ttl: Duration::from_secs(20),
            tick_interval: Duration::from_millis(20),
            block_cache_limit: 8 * MAX_BLOCK_FETCH,
            min_desired_peer_count: 5,
            peer_count_timeout: Duration::from_secs(12),
        }
    }
}

impl SyncConfig {
    /// Configuration preset with short timeouts, for tests and local nets.
    pub fn rapid() -> Self {
        Self {
            hash_ttl: Duration::from_millis(100),
            block_ttl: Duration::from_millis(100),
            tick_interval: Duration::from_millis(5),
            ..Self::default()
        }
    }
}
