use bytes::Bytes;

use crate::{BlockId, ConsensusParams, Height, Timestamp, ValidatorSet};

/// The chain state the core starts a height from, as loaded from the state
/// store and updated by applying blocks.
#[derive(Clone, Debug)]
pub struct ChainState {
    /// The chain identifier, mixed into every signature.
    pub chain_id: String,

    /// The first height of the chain, from genesis.
    pub initial_height: Height,

    /// Height of the last committed block, zero before the first commit.
    pub last_block_height: Height,

    /// ID of the last committed block, nil before the first commit.
    pub last_block_id: BlockId,

    /// Time of the last committed block.
    pub last_block_time: Timestamp,

    /// The validator set for the next height.
    pub validators: ValidatorSet,

    /// The validator set of the last committed height, used to check its
    /// commit.
    pub last_validators: ValidatorSet,

    /// Application state hash after the last committed block.
    pub app_hash: Bytes,

    /// Consensus parameters in force.
    pub consensus_params: ConsensusParams,
}

impl ChainState {
    /// The height consensus should run next.
    pub fn next_height(&self) -> Height {
        if self.last_block_height == Height::ZERO {
            self.initial_height
        } else {
            self.last_block_height.increment()
        }
    }
}
