//! A scripted block executor standing in for the application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use tenderbft_core_types::{
    merkle, Address, Block, BlockExecutor, BlockId, BoxError, ChainState, Commit, ExtendedCommit,
    Header, Height, SignedVote, Timestamp, Tx, Vote,
};

use crate::MemStateStore;

/// A [`BlockExecutor`] for tests: builds blocks from a scripted
/// transaction queue, accepts everything unless told otherwise, and writes
/// applied states back to the state store.
pub struct TestExecutor {
    state_store: Arc<MemStateStore>,
    pending_txs: Mutex<Vec<Tx>>,
    reject_proposals: AtomicBool,
    vote_extension: Bytes,
}

impl TestExecutor {
    /// Create an executor writing applied states into `state_store`.
    pub fn new(state_store: Arc<MemStateStore>) -> Self {
        Self {
            state_store,
            pending_txs: Mutex::new(Vec::new()),
            reject_proposals: AtomicBool::new(false),
            vote_extension: Bytes::from_static(b"extension"),
        }
    }

    /// Queue transactions for the next proposal.
    pub fn add_txs(&self, txs: impl IntoIterator<Item = Tx>) {
        self.pending_txs.lock().unwrap().extend(txs);
    }

    /// Make `process_proposal` reject every proposal from now on.
    pub fn reject_proposals(&self) {
        self.reject_proposals.store(true, Ordering::SeqCst);
    }

    /// Build a block on top of `state` the same way the executor does, for
    /// feeding hand-crafted proposals into a node under test.
    pub fn build_block(state: &ChainState, txs: Vec<Tx>, time: Timestamp, proposer: Address) -> Block {
        let last_commit = Commit::empty();

        Block {
            header: Header {
                chain_id: state.chain_id.clone(),
                height: state.next_height(),
                time,
                last_block_id: state.last_block_id,
                last_commit_hash: last_commit.hash(),
                data_hash: merkle::root_hash(&txs),
                validators_hash: state.validators.hash(),
                app_hash: state.app_hash.clone(),
                proposer_address: proposer,
            },
            data: txs,
            last_commit,
            evidence: Vec::new(),
        }
    }
}

#[async_trait]
impl BlockExecutor for TestExecutor {
    async fn create_proposal_block(
        &self,
        height: Height,
        state: &ChainState,
        last_ext_commit: &ExtendedCommit,
        proposer: &Address,
    ) -> Result<Block, BoxError> {
        debug_assert_eq!(height, state.next_height());

        let txs = std::mem::take(&mut *self.pending_txs.lock().unwrap());
        let last_commit = last_ext_commit.strip_extensions();

        Ok(Block {
            header: Header {
                chain_id: state.chain_id.clone(),
                height,
                time: Timestamp::now(),
                last_block_id: state.last_block_id,
                last_commit_hash: last_commit.hash(),
                data_hash: merkle::root_hash(&txs),
                validators_hash: state.validators.hash(),
                app_hash: state.app_hash.clone(),
                proposer_address: *proposer,
            },
            data: txs,
            last_commit,
            evidence: Vec::new(),
        })
    }

    async fn validate_block(&self, state: &ChainState, block: &Block) -> Result<(), BoxError> {
        if block.header.height != state.next_height() {
            return Err(format!(
                "block height {} does not follow state height {}",
                block.header.height, state.last_block_height
            )
            .into());
        }

        if block.header.chain_id != state.chain_id {
            return Err("wrong chain id".into());
        }

        Ok(())
    }

    async fn process_proposal(
        &self,
        _block: &Block,
        _state: &ChainState,
    ) -> Result<bool, BoxError> {
        Ok(!self.reject_proposals.load(Ordering::SeqCst))
    }

    async fn apply_block(
        &self,
        state: ChainState,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<ChainState, BoxError> {
        let mut validators = state.validators.clone();
        validators.advance_proposer_priority(1);

        let new_state = ChainState {
            chain_id: state.chain_id.clone(),
            initial_height: state.initial_height,
            last_block_height: block.header.height,
            last_block_id: *block_id,
            last_block_time: block.header.time,
            validators,
            last_validators: state.validators,
            app_hash: state.app_hash,
            consensus_params: state.consensus_params,
        };

        self.state_store.save(new_state.clone());

        Ok(new_state)
    }

    async fn extend_vote(&self, _vote: &Vote) -> Result<Bytes, BoxError> {
        Ok(self.vote_extension.clone())
    }

    async fn verify_vote_extension(&self, vote: &SignedVote) -> Result<(), BoxError> {
        if vote.vote.extension == self.vote_extension {
            Ok(())
        } else {
            Err("unexpected vote extension".into())
        }
    }
}
