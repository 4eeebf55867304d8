//! # strand-sync — block-chain synchronization engine.
//!
//! Given a set of remote peers each claiming a chain head, the engine
//! walks the hash sequence back from a target head until it reaches a hash
//! the local chain already knows, then downloads the corresponding blocks
//! from multiple peers in parallel and surfaces them in chain order to the
//! host's insertion pipeline.
//!
//! The main entry point is [`Downloader::synchronise`], which drives both
//! phases to completion over the peer transports registered with
//! [`Downloader::register_peer`]. The transport layer feeds responses back
//! through [`Downloader::deliver_hashes`] and [`Downloader::deliver_blocks`];
//! the consumer drains finished work with [`Downloader::take_blocks`].

pub mod config;
pub mod downloader;
pub mod peers;
pub mod queue;

pub use config::{MAX_BLOCK_FETCH, MAX_HASH_FETCH, SyncConfig};
pub use downloader::Downloader;
pub use peers::{Peer, PeerSet, REP_CEILING, REP_FLOOR};
pub use queue::{BlockQueue, BlockRequest};
