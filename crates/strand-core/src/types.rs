//! Core chain types consumed by the sync engine.
//!
//! The engine treats blocks as opaque except for three facts: the block's
//! own hash (its identity), the hash of its parent, and its number. The
//! payload travels through untouched.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{CodecError, HashParseError};

/// A 32-byte opaque identifier.
///
/// Used for block hashes and as the wire currency of hash backfill.
/// Equality and hashing are bytewise.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes), meaning "no origin known".
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a Hash256 from a 64-character lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        let raw = hex::decode(s).map_err(|e| HashParseError::InvalidHex(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| HashParseError::InvalidLength(v.len()))?;
        Ok(Self(bytes))
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Abbreviated hex form (first 4 bytes) for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Block header: the part of a block the sync engine actually reads.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u64,
    /// Hash of the parent block header.
    pub parent_hash: Hash256,
    /// Height of this block; the parent's number plus one.
    pub number: u64,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Commitment to the block payload.
    pub payload_root: Hash256,
}

impl BlockHeader {
    /// Serialized header size for hashing (3 u64 fields + 2 * 32-byte hashes).
    const HASH_SIZE: usize = 3 * 8 + 2 * 32;

    /// Compute the block header hash (SHA-256).
    ///
    /// Uses an explicit fixed byte layout: version || parent_hash || number ||
    /// timestamp || payload_root, integers little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.parent_hash.as_bytes());
        data.extend_from_slice(&self.number.to_le_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(self.payload_root.as_bytes());
        Hash256(Sha256::digest(&data).into())
    }
}

/// A complete block: header plus opaque payload.
///
/// Two blocks are equal iff their contents are equal, which for linked
/// chains coincides with equality of [`Block::hash`].
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Opaque body bytes; never inspected by the sync engine.
    pub payload: Vec<u8>,
}

impl Block {
    /// The block's identity: its header hash.
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Hash of the parent block.
    pub fn parent_hash(&self) -> Hash256 {
        self.header.parent_hash
    }

    /// Block number (height).
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Canonical byte encoding (bincode, standard config).
    ///
    /// This is the form hosts ship across the wire and persist; the header
    /// hash is deliberately independent of it.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode a block from its canonical byte encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (block, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(block)
    }
}
