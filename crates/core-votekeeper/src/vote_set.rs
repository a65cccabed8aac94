//! The vote set for a single (height, round, type).

use thiserror::Error;

use tenderbft_core_types::{
    Address, BlockId, BlockIdFlag, Commit, CommitSig, ExtendedCommit, ExtendedCommitSig, Height,
    Round, SignedVote, ThresholdParam, ValidatorSet, VoteType,
};

use crate::{VoteCount, Weight};

/// Reasons a vote is rejected by [`VoteSet::add_vote`].
#[derive(Debug, Error)]
pub enum AddVoteError {
    /// The vote is for a different (height, round, type) than the set.
    #[error("vote for {got_height}/{got_round}/{got_type} does not match set {height}/{round}/{vote_type}")]
    WrongKey {
        /// Height of the set.
        height: Height,
        /// Round of the set.
        round: Round,
        /// Type of the set.
        vote_type: VoteType,
        /// Height of the vote.
        got_height: Height,
        /// Round of the vote.
        got_round: Round,
        /// Type of the vote.
        got_type: VoteType,
    },

    /// The voter is not in the validator set.
    #[error("vote from unknown validator {0}")]
    UnknownValidator(Address),

    /// The vote's validator index does not match its address.
    #[error("vote from {address} carries index {got}, expected {expected}")]
    IndexMismatch {
        /// The voter.
        address: Address,
        /// Index in the vote.
        got: u32,
        /// Index in the validator set.
        expected: u32,
    },

    /// The vote signature does not verify.
    #[error("invalid signature on vote from {0}")]
    InvalidSignature(Address),

    /// The validator already voted for a different block at this
    /// (height, round, type). Carries both votes for the evidence pool.
    #[error("conflicting votes from validator {address}")]
    ConflictingVotes {
        /// The equivocating validator.
        address: Address,
        /// The vote already stored.
        existing: Box<SignedVote>,
        /// The newly received, conflicting vote.
        conflicting: Box<SignedVote>,
    },
}

/// All votes of one type at one (height, round): at most one vote per
/// validator, tallied by block ID against the two-thirds thresholds.
#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: String,
    height: Height,
    round: Round,
    vote_type: VoteType,
    validators: ValidatorSet,
    votes: Vec<Option<SignedVote>>,
    count: VoteCount,
    maj23: Option<BlockId>,
}

impl VoteSet {
    /// Create an empty vote set.
    pub fn new(
        chain_id: String,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> Self {
        Self {
            chain_id,
            height,
            round,
            vote_type,
            votes: vec![None; validators.len()],
            validators,
            count: VoteCount::new(),
            maj23: None,
        }
    }

    /// The vote type this set tallies.
    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// The round this set tallies.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Add a vote after verifying its key, validator and signature.
    ///
    /// Returns `Ok(false)` for an exact duplicate, and
    /// [`AddVoteError::ConflictingVotes`] carrying both votes when the same
    /// validator votes for a different block.
    pub fn add_vote(&mut self, vote: SignedVote) -> Result<bool, AddVoteError> {
        if vote.vote.height != self.height
            || vote.vote.round != self.round
            || vote.vote.vote_type != self.vote_type
        {
            return Err(AddVoteError::WrongKey {
                height: self.height,
                round: self.round,
                vote_type: self.vote_type,
                got_height: vote.vote.height,
                got_round: vote.vote.round,
                got_type: vote.vote.vote_type,
            });
        }

        let address = vote.vote.validator_address;

        let Some((index, validator)) = self.validators.get_by_address(&address) else {
            return Err(AddVoteError::UnknownValidator(address));
        };

        if vote.vote.validator_index != index {
            return Err(AddVoteError::IndexMismatch {
                address,
                got: vote.vote.validator_index,
                expected: index,
            });
        }

        if let Some(existing) = &self.votes[index as usize] {
            if existing.vote.block_id == vote.vote.block_id {
                return Ok(false);
            }

            return Err(AddVoteError::ConflictingVotes {
                address,
                existing: Box::new(existing.clone()),
                conflicting: Box::new(vote),
            });
        }

        validator
            .pub_key
            .verify(&vote.vote.sign_bytes(&self.chain_id), &vote.signature)
            .map_err(|_| AddVoteError::InvalidSignature(address))?;

        let weight = validator.voting_power;
        let block_id = vote.vote.block_id;

        self.votes[index as usize] = Some(vote);
        let block_weight = self.count.add(block_id, weight);

        // At most one block ID can ever cross two thirds; record the first.
        if self.maj23.is_none()
            && ThresholdParam::TWO_THIRDS.is_met(block_weight, self.total_weight())
        {
            self.maj23 = Some(block_id);
        }

        Ok(true)
    }

    /// The vote stored for a validator, if any.
    pub fn get_by_address(&self, address: &Address) -> Option<&SignedVote> {
        let (index, _) = self.validators.get_by_address(address)?;
        self.votes[index as usize].as_ref()
    }

    /// The unique block ID (nil included) that accumulated more than two
    /// thirds of the total voting power, if any.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    /// Whether votes of any kind exceed two thirds of the total power.
    pub fn two_thirds_any(&self) -> bool {
        ThresholdParam::TWO_THIRDS.is_met(self.count.sum(), self.total_weight())
    }

    /// Whether every validator has voted.
    pub fn has_all(&self) -> bool {
        self.count.sum() == self.total_weight()
    }

    /// The weight tallied for a block ID.
    pub fn block_weight(&self, block_id: &BlockId) -> Weight {
        self.count.get(block_id)
    }

    /// The total accepted weight.
    pub fn weight_sum(&self) -> Weight {
        self.count.sum()
    }

    /// Iterate over the stored votes.
    pub fn votes(&self) -> impl Iterator<Item = &SignedVote> {
        self.votes.iter().flatten()
    }

    /// Build the commit this set justifies. `None` unless a non-nil block
    /// has a two-thirds majority.
    pub fn make_commit(&self) -> Option<Commit> {
        let block_id = self.maj23.filter(|id| !id.is_nil())?;

        let signatures = self
            .validators
            .iter()
            .enumerate()
            .map(|(index, validator)| match &self.votes[index] {
                Some(vote) => CommitSig {
                    flag: if vote.vote.block_id == block_id {
                        BlockIdFlag::Commit
                    } else {
                        BlockIdFlag::Nil
                    },
                    validator_address: validator.address,
                    timestamp: vote.vote.timestamp,
                    signature: Some(vote.signature),
                },
                None => CommitSig::absent(validator.address),
            })
            .collect();

        Some(Commit {
            height: self.height,
            round: self.round,
            block_id,
            signatures,
        })
    }

    /// Build the extended commit this set justifies, carrying the vote
    /// extensions alongside the signatures.
    pub fn make_extended_commit(&self) -> Option<ExtendedCommit> {
        let commit = self.make_commit()?;

        let signatures = commit
            .signatures
            .iter()
            .enumerate()
            .map(|(index, commit_sig)| {
                let (extension, extension_signature) = match &self.votes[index] {
                    Some(vote) => (vote.vote.extension.clone(), vote.extension_signature),
                    None => (bytes::Bytes::new(), None),
                };

                ExtendedCommitSig {
                    commit_sig: commit_sig.clone(),
                    extension,
                    extension_signature,
                }
            })
            .collect();

        Some(ExtendedCommit {
            height: commit.height,
            round: commit.round,
            block_id: commit.block_id,
            signatures,
        })
    }

    fn total_weight(&self) -> Weight {
        self.validators.total_voting_power()
    }
}
