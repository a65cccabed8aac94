//! Capability interfaces for the collaborators the core consumes.
//!
//! The core owns none of these: block execution, storage, signing, the
//! mempool signal and evidence handling are all injected behind the traits
//! below and invoked synchronously from the driver task.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{
    Address, Block, BlockId, BoxError, ChainState, Commit, ExtendedCommit, Header, Height,
    PartSet, Proposal, PublicKey, Signature, SignedVote, Vote,
};

/// Stored metadata of a block.
#[derive(Clone, Debug)]
pub struct BlockMeta {
    /// The block's ID.
    pub block_id: BlockId,

    /// The block's header.
    pub header: Header,
}

/// Persistent store of committed blocks.
pub trait BlockStore: Send + Sync {
    /// Height of the newest stored block, zero when empty.
    fn height(&self) -> Height;

    /// Height of the oldest stored block, zero when empty.
    fn base(&self) -> Height;

    /// Save a block with its parts and the commit witnessed for it.
    fn save_block(&self, block: Block, parts: &PartSet, seen_commit: Commit);

    /// Save a block with its parts and the extended commit witnessed for
    /// it. Used when vote extensions are enabled at the block's height.
    fn save_block_with_extended_commit(
        &self,
        block: Block,
        parts: &PartSet,
        seen_ext_commit: ExtendedCommit,
    );

    /// Load a stored block.
    fn load_block(&self, height: Height) -> Option<Block>;

    /// Load the canonical commit for a height, ie. the `last_commit` of the
    /// following block.
    fn load_block_commit(&self, height: Height) -> Option<Commit>;

    /// Load the locally witnessed commit of the newest stored block.
    fn load_seen_commit(&self) -> Option<Commit>;

    /// Load the extended commit for a height, if one was stored.
    fn load_block_extended_commit(&self, height: Height) -> Option<ExtendedCommit>;

    /// Load a stored block's metadata.
    fn load_block_meta(&self, height: Height) -> Option<BlockMeta>;
}

/// Source of the chain state to start from.
pub trait StateStore: Send + Sync {
    /// Load the persisted chain state.
    fn load(&self) -> Result<ChainState, BoxError>;
}

/// Block execution, proposal processing and vote extension handling.
#[async_trait]
pub trait BlockExecutor: Send + Sync {
    /// Build a proposal block on top of the current state.
    async fn create_proposal_block(
        &self,
        height: Height,
        state: &ChainState,
        last_ext_commit: &ExtendedCommit,
        proposer: &Address,
    ) -> Result<Block, BoxError>;

    /// Check a block's structural validity against the chain state.
    async fn validate_block(&self, state: &ChainState, block: &Block) -> Result<(), BoxError>;

    /// Ask the application whether it accepts the proposed block.
    async fn process_proposal(&self, block: &Block, state: &ChainState)
        -> Result<bool, BoxError>;

    /// Execute the block and produce the next chain state.
    async fn apply_block(
        &self,
        state: ChainState,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<ChainState, BoxError>;

    /// Ask the application for extension data to attach to a precommit.
    async fn extend_vote(&self, vote: &Vote) -> Result<Bytes, BoxError>;

    /// Ask the application to verify a peer's vote extension.
    async fn verify_vote_extension(&self, vote: &SignedVote) -> Result<(), BoxError>;
}

/// Errors surfaced by a [`PrivValidator`].
#[derive(Debug, Error)]
pub enum SignerError {
    /// The signer refused to sign, eg. its double-sign guard fired.
    #[error("signer refused to sign: {0}")]
    Refused(String),

    /// The signer did not answer within the deadline.
    #[error("signing timed out")]
    Timeout,

    /// Transport or backend failure.
    #[error("signer failure: {0}")]
    Failure(#[from] BoxError),
}

/// The validator's signing key, possibly remote.
///
/// Implementations must enforce their own double-sign protection: refuse to
/// sign a message conflicting with one already signed at the same height,
/// round and step.
#[async_trait]
pub trait PrivValidator: Send + Sync {
    /// The signer's current public key. Keys may rotate between heights.
    async fn get_pub_key(&self) -> Result<PublicKey, SignerError>;

    /// Sign a vote. Returns the vote signature and, when the vote carries
    /// extension data, the signature over the extension.
    async fn sign_vote(
        &self,
        chain_id: &str,
        vote: &Vote,
    ) -> Result<(Signature, Option<Signature>), SignerError>;

    /// Sign a proposal.
    async fn sign_proposal(
        &self,
        chain_id: &str,
        proposal: &Proposal,
    ) -> Result<Signature, SignerError>;
}

/// Signal from the mempool that transactions are available.
#[async_trait]
pub trait TxNotifier: Send + Sync {
    /// Resolves once transactions become available. Must be cancel-safe;
    /// implementations typically wrap a `tokio::sync::Notify`.
    async fn txs_available(&self);
}

/// Sink for equivocation evidence.
pub trait EvidencePool: Send + Sync {
    /// Report a pair of conflicting votes from the same validator.
    fn report_conflicting_votes(&self, vote_a: SignedVote, vote_b: SignedVote);
}
