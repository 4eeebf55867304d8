//! Error types for the Strand sync engine.
use thiserror::Error;

/// Errors surfaced to the caller of a synchronisation run.
///
/// Validation failures inside the block phase are *not* represented here;
/// those demote the offending peer and are otherwise swallowed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("synchronisation already running")] Busy,
    #[error("residual blocks pending in the queue")] PendingQueue,
    #[error("unknown peer: {0}")] UnknownPeer(String),
    #[error("hash fetch timed out with no fallback peer")] Timeout,
    #[error("peer returned an empty hash set")] EmptyHashSet,
    #[error("no peers left to download from")] NoPeers,
    #[error("no idle peer could take a reservation")] PeersUnavailable,
    #[error("hash fetch cancelled")] HashFetchCancelled,
    #[error("block fetch cancelled")] BlockFetchCancelled,
    #[error("no synchronisation active")] NoSyncActive,
}

/// Errors from peer registration bookkeeping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerSetError {
    #[error("peer already registered: {0}")] AlreadyRegistered(String),
    #[error("unknown peer: {0}")] UnknownPeer(String),
}

/// Block-delivery validation failures inside the queue.
///
/// Never surfaced from `synchronise`; the orchestrator demotes the
/// delivering peer and moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("peer holds no reservation: {0}")] NoReservation(String),
    #[error("block not requested: {0}")] NotRequested(String),
    #[error("block number mismatch: got {got}, expected {expected}")] NumberMismatch { got: u64, expected: u64 },
    #[error("parent mismatch for block {0}")] ParentMismatch(String),
    #[error("duplicate block in delivery: {0}")] DuplicateBlock(String),
    #[error("empty delivery")] EmptyDelivery,
}

/// Errors from a peer's outbound request path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("peer is not idle")] NotIdle,
    #[error("transport closed")] TransportClosed,
    #[error("transport: {0}")] Transport(String),
}

/// Failure to parse a [`Hash256`](crate::types::Hash256) from hex.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashParseError {
    #[error("invalid hex: {0}")] InvalidHex(String),
    #[error("invalid length: {0} bytes, expected 32")] InvalidLength(usize),
}

/// Failure to encode or decode a block's canonical byte form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode: {0}")] Encode(String),
    #[error("decode: {0}")] Decode(String),
}
