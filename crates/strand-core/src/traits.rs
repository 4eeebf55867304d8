//! Trait interfaces at the engine's boundary.
//!
//! These traits define the contracts between the sync engine and its host:
//! - [`ChainView`] — read access to the locally stored chain (the host's
//!   chain store implements this).
//! - [`FetchTransport`] — a single peer's outbound request path (the host's
//!   wire layer implements this, one instance per registered peer).
//!
//! Responses to [`FetchTransport`] requests do not return through the trait;
//! they arrive asynchronously through the downloader's delivery sinks.

use crate::error::FetchError;
use crate::types::{Block, Hash256};

/// Read-only view of the locally stored chain.
///
/// The engine uses this to terminate the hash backfill at the first
/// locally-known ancestor and to anchor the block-number offset of the
/// download window.
pub trait ChainView: Send + Sync {
    /// Whether the local chain already knows this block hash.
    fn has_block(&self, hash: &Hash256) -> bool;

    /// Fetch a locally stored block. Returns `None` if unknown.
    fn get_block(&self, hash: &Hash256) -> Option<Block>;
}

/// Outbound request path to one remote peer.
///
/// Both methods are fire-and-forget: they enqueue a request on the wire and
/// return. The peer's responses arrive later via
/// `Downloader::deliver_hashes` / `Downloader::deliver_blocks`, tagged with
/// the peer's id. Handing the transport to the [`Peer`] as a trait object
/// keeps the peer handle out of the callback's capture.
pub trait FetchTransport: Send + Sync {
    /// Ask the peer for a batch of ancestor hashes walking back from `from`
    /// (exclusive), ordered tip-to-genesis.
    fn request_hashes(&self, from: Hash256) -> Result<(), FetchError>;

    /// Ask the peer for the full blocks matching `hashes`.
    fn request_blocks(&self, hashes: &[Hash256]) -> Result<(), FetchError>;
}
