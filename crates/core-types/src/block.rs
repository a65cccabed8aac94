use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use bytes::Bytes;
use thiserror::Error;

use crate::{Address, BlockId, Commit, Hash, Height, SignedVote, Timestamp};

/// A transaction, opaque to the consensus core.
pub type Tx = Bytes;

/// The header of a block.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Header {
    /// The chain this block belongs to.
    pub chain_id: String,

    /// The height of this block.
    pub height: Height,

    /// The proposer-assigned block time.
    pub time: Timestamp,

    /// The ID of the previous block, nil at the initial height.
    pub last_block_id: BlockId,

    /// Merkle-free digest of the last commit.
    pub last_commit_hash: Hash,

    /// Merkle root over the transactions.
    pub data_hash: Hash,

    /// Hash of the validator set for this height.
    pub validators_hash: Hash,

    /// Application state hash after the previous block.
    pub app_hash: Bytes,

    /// Address of the proposer of this block.
    pub proposer_address: Address,
}

/// Evidence of validator misbehavior carried in a block.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum Evidence {
    /// Two conflicting votes signed by the same validator at the same
    /// height, round and vote type.
    DuplicateVote {
        /// The first vote observed.
        vote_a: SignedVote,
        /// The conflicting vote.
        vote_b: SignedVote,
    },
}

/// A block: header, transactions, the commit for the previous height, and
/// any evidence of misbehavior.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    /// The block header.
    pub header: Header,

    /// The transactions.
    pub data: Vec<Tx>,

    /// The precommits that justified the previous height.
    pub last_commit: Commit,

    /// Evidence of validator misbehavior.
    pub evidence: Vec<Evidence>,
}

/// Reasons a block fails to decode or exceeds limits.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The encoded block does not parse.
    #[error("malformed block encoding: {0}")]
    Malformed(#[from] borsh::io::Error),

    /// The encoded block exceeds the configured maximum size.
    #[error("block size {size} exceeds maximum {max_bytes}")]
    TooLarge {
        /// The encoded size.
        size: u64,
        /// The configured limit.
        max_bytes: u64,
    },
}

impl Block {
    /// The hash of this block, ie. the digest of its encoded header.
    pub fn hash(&self) -> Hash {
        let bytes = borsh::to_vec(&self.header).expect("header encoding cannot fail");
        Hash::digest(bytes)
    }

    /// Encode the block for transport or storage.
    pub fn encode(&self) -> Bytes {
        Bytes::from(borsh::to_vec(self).expect("block encoding cannot fail"))
    }

    /// Decode a block, enforcing the given size limit.
    pub fn decode(bytes: &[u8], max_bytes: u64) -> Result<Self, BlockError> {
        if bytes.len() as u64 > max_bytes {
            return Err(BlockError::TooLarge {
                size: bytes.len() as u64,
                max_bytes,
            });
        }

        Ok(borsh::from_slice(bytes)?)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("height", &self.header.height)
            .field("hash", &self.hash())
            .field("txs", &self.data.len())
            .finish()
    }
}
