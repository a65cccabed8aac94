use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::Hash;

/// Metadata of a complete part set: the number of parts and the Merkle root
/// over their contents.
#[derive(
    Copy,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct PartSetHeader {
    /// Total number of parts.
    pub total: u32,

    /// Merkle root over the part contents.
    pub hash: Hash,
}

impl PartSetHeader {
    /// Create a new part set header.
    pub const fn new(total: u32, hash: Hash) -> Self {
        Self { total, hash }
    }

    /// Whether this is the zero (nil) header.
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

impl fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.total, self.hash)
    }
}

impl fmt::Debug for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartSetHeader({}:{:?})", self.total, self.hash)
    }
}

/// Identifies a block by its hash and the header of the part set that
/// carries its encoding.
///
/// The all-zero value means *nil*, ie. "no block": nil votes and empty
/// `last_block_id` fields use it.
#[derive(
    Copy,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct BlockId {
    /// The block hash.
    pub hash: Hash,

    /// The header of the block's part set.
    pub part_set_header: PartSetHeader,
}

impl BlockId {
    /// Create a new block ID.
    pub const fn new(hash: Hash, part_set_header: PartSetHeader) -> Self {
        Self {
            hash,
            part_set_header,
        }
    }

    /// The nil block ID.
    pub const fn nil() -> Self {
        Self {
            hash: Hash::ZERO,
            part_set_header: PartSetHeader::new(0, Hash::ZERO),
        }
    }

    /// Whether this is the nil block ID.
    pub fn is_nil(&self) -> bool {
        self.hash.is_zero() && self.part_set_header.is_zero()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else {
            write!(f, "{}", self.hash)
        }
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({self})")
    }
}
