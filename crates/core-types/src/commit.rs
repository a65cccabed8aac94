use borsh::{BorshDeserialize, BorshSerialize};
use bytes::Bytes;
use thiserror::Error;

use crate::{
    Address, BlockId, Hash, Height, Round, Signature, ThresholdParam, Timestamp, ValidatorSet,
    Vote, VoteType,
};

/// How a validator's slot in a commit is filled.
#[derive(Copy, Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum BlockIdFlag {
    /// The validator did not vote.
    Absent,

    /// The validator precommitted the committed block.
    Commit,

    /// The validator precommitted nil.
    Nil,
}

/// One validator's entry in a commit.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct CommitSig {
    /// How the slot is filled.
    pub flag: BlockIdFlag,

    /// Address of the validator.
    pub validator_address: Address,

    /// The vote timestamp, meaningless when absent.
    pub timestamp: Timestamp,

    /// The vote signature, `None` when absent.
    pub signature: Option<Signature>,
}

impl CommitSig {
    /// An absent entry for the given validator.
    pub fn absent(validator_address: Address) -> Self {
        Self {
            flag: BlockIdFlag::Absent,
            validator_address,
            timestamp: Timestamp::UNIX_EPOCH,
            signature: None,
        }
    }

    /// Whether the validator voted at all.
    pub fn is_present(&self) -> bool {
        !matches!(self.flag, BlockIdFlag::Absent)
    }

    /// The block ID this entry's vote was for.
    pub fn vote_block_id(&self, commit_block_id: BlockId) -> BlockId {
        match self.flag {
            BlockIdFlag::Commit => commit_block_id,
            BlockIdFlag::Absent | BlockIdFlag::Nil => BlockId::nil(),
        }
    }
}

/// Errors validating a commit against a validator set.
#[derive(Debug, Error)]
pub enum CommitError {
    /// Signature count does not match the validator set size.
    #[error("commit has {got} signatures, validator set has {expected} validators")]
    SignatureCount {
        /// Signatures present.
        got: usize,
        /// Validators expected.
        expected: usize,
    },

    /// A commit signature is from the wrong validator.
    #[error("commit signature {index} is from {got}, expected {expected}")]
    WrongValidator {
        /// Slot index.
        index: usize,
        /// Address found.
        got: Address,
        /// Address expected.
        expected: Address,
    },

    /// A commit signature fails verification.
    #[error("invalid commit signature from {0}")]
    InvalidSignature(Address),

    /// The committing power does not exceed two thirds.
    #[error("commit power {got} does not exceed 2/3 of total {total}")]
    InsufficientPower {
        /// Power of valid Commit-flagged signatures.
        got: u64,
        /// Total voting power.
        total: u64,
    },
}

/// The precommits that justified committing a block.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    /// The committed height.
    pub height: Height,

    /// The round the block was committed in.
    pub round: Round,

    /// The committed block.
    pub block_id: BlockId,

    /// One entry per validator, in validator set order.
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// An empty commit, used as `last_commit` of the initial height.
    pub fn empty() -> Self {
        Self {
            height: Height::ZERO,
            round: Round::ZERO,
            block_id: BlockId::nil(),
            signatures: Vec::new(),
        }
    }

    /// The digest of this commit, referenced by the next block's header.
    pub fn hash(&self) -> Hash {
        let bytes = borsh::to_vec(self).expect("commit encoding cannot fail");
        Hash::digest(bytes)
    }

    /// Reconstruct the precommit a slot stands for, to check its signature.
    pub fn vote(&self, index: usize) -> Option<Vote> {
        let sig = self.signatures.get(index)?;

        Some(Vote {
            vote_type: VoteType::Precommit,
            height: self.height,
            round: self.round,
            block_id: sig.vote_block_id(self.block_id),
            timestamp: sig.timestamp,
            validator_address: sig.validator_address,
            validator_index: index as u32,
            extension: Bytes::new(),
        })
    }

    /// Validate this commit against the validator set of its height:
    /// slot order, signatures, and that the Commit-flagged power strictly
    /// exceeds two thirds of the total.
    pub fn validate(&self, validators: &ValidatorSet, chain_id: &str) -> Result<(), CommitError> {
        if self.signatures.len() != validators.len() {
            return Err(CommitError::SignatureCount {
                got: self.signatures.len(),
                expected: validators.len(),
            });
        }

        let mut commit_power: u64 = 0;

        for (index, (sig, validator)) in
            self.signatures.iter().zip(validators.iter()).enumerate()
        {
            if sig.validator_address != validator.address {
                return Err(CommitError::WrongValidator {
                    index,
                    got: sig.validator_address,
                    expected: validator.address,
                });
            }

            if !sig.is_present() {
                continue;
            }

            let vote = self.vote(index).expect("index in bounds");
            let signature = sig
                .signature
                .as_ref()
                .ok_or(CommitError::InvalidSignature(sig.validator_address))?;

            validator
                .pub_key
                .verify(&vote.sign_bytes(chain_id), signature)
                .map_err(|_| CommitError::InvalidSignature(sig.validator_address))?;

            if matches!(sig.flag, BlockIdFlag::Commit) {
                commit_power += validator.voting_power;
            }
        }

        let total = validators.total_voting_power();
        if !ThresholdParam::TWO_THIRDS.is_met(commit_power, total) {
            return Err(CommitError::InsufficientPower {
                got: commit_power,
                total,
            });
        }

        Ok(())
    }
}

/// One validator's entry in an extended commit.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct ExtendedCommitSig {
    /// The plain commit entry.
    pub commit_sig: CommitSig,

    /// The vote extension data.
    pub extension: Bytes,

    /// Signature over the extension data.
    pub extension_signature: Option<Signature>,
}

/// A commit that also carries per-vote extension data, stored when vote
/// extensions are enabled at the committed height.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct ExtendedCommit {
    /// The committed height.
    pub height: Height,

    /// The round the block was committed in.
    pub round: Round,

    /// The committed block.
    pub block_id: BlockId,

    /// One entry per validator, in validator set order.
    pub signatures: Vec<ExtendedCommitSig>,
}

impl ExtendedCommit {
    /// An empty extended commit, used as `last_ext_commit` of the initial
    /// height.
    pub fn empty() -> Self {
        Self {
            height: Height::ZERO,
            round: Round::ZERO,
            block_id: BlockId::nil(),
            signatures: Vec::new(),
        }
    }

    /// Drop the extension data, leaving a plain commit.
    pub fn strip_extensions(&self) -> Commit {
        Commit {
            height: self.height,
            round: self.round,
            block_id: self.block_id,
            signatures: self
                .signatures
                .iter()
                .map(|sig| sig.commit_sig.clone())
                .collect(),
        }
    }
}
