//! All vote sets of one height, keyed by round and type.

use std::collections::BTreeMap;

use tenderbft_core_types::{Height, Round, SignedVote, ValidatorSet, VoteType};

use crate::{AddVoteError, EvidenceMap, VoteSet};

struct RoundVoteSets {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// The vote sets for every round of the current height.
///
/// Rounds are created lazily: entering a round materializes it and the next
/// one, and votes from farther ahead materialize their round on arrival so
/// that two-thirds thresholds at higher rounds (round skipping) are
/// observable.
pub struct HeightVoteSet {
    chain_id: String,
    height: Height,
    validators: ValidatorSet,
    round: Round,
    round_vote_sets: BTreeMap<u32, RoundVoteSets>,
    evidence: EvidenceMap,
}

impl HeightVoteSet {
    /// Create the vote sets for a height, with rounds 0 and 1
    /// materialized.
    pub fn new(chain_id: String, height: Height, validators: ValidatorSet) -> Self {
        let mut hvs = Self {
            chain_id,
            height,
            validators,
            round: Round::ZERO,
            round_vote_sets: BTreeMap::new(),
            evidence: EvidenceMap::new(),
        };

        hvs.ensure_round(0);
        hvs.ensure_round(1);
        hvs
    }

    /// The height these sets tally.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Enter a round: materializes it and the immediate next round.
    pub fn set_round(&mut self, round: Round) {
        if let Some(r) = round.as_u32() {
            self.round = round;
            self.ensure_round(r);
            self.ensure_round(r + 1);
        }
    }

    fn ensure_round(&mut self, round: u32) {
        let Self {
            chain_id,
            height,
            validators,
            round_vote_sets,
            ..
        } = self;

        round_vote_sets.entry(round).or_insert_with(|| {
            let key = Round::new(round);
            RoundVoteSets {
                prevotes: VoteSet::new(
                    chain_id.clone(),
                    *height,
                    key,
                    VoteType::Prevote,
                    validators.clone(),
                ),
                precommits: VoteSet::new(
                    chain_id.clone(),
                    *height,
                    key,
                    VoteType::Precommit,
                    validators.clone(),
                ),
            }
        });
    }

    /// Add a vote to the set for its (round, type).
    ///
    /// Conflicting votes are recorded in the evidence map before the error
    /// is returned, so both votes stay available.
    pub fn add_vote(&mut self, vote: SignedVote) -> Result<bool, AddVoteError> {
        let Some(round) = vote.vote.round.as_u32() else {
            return Ok(false);
        };

        self.ensure_round(round);

        let sets = self
            .round_vote_sets
            .get_mut(&round)
            .expect("round just materialized");

        let set = match vote.vote.vote_type {
            VoteType::Prevote => &mut sets.prevotes,
            VoteType::Precommit => &mut sets.precommits,
        };

        match set.add_vote(vote) {
            Err(AddVoteError::ConflictingVotes {
                address,
                existing,
                conflicting,
            }) => {
                self.evidence
                    .add((*existing).clone(), (*conflicting).clone());

                Err(AddVoteError::ConflictingVotes {
                    address,
                    existing,
                    conflicting,
                })
            }
            other => other,
        }
    }

    /// The prevote set for a round, if materialized.
    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.get(round, VoteType::Prevote)
    }

    /// The precommit set for a round, if materialized.
    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.get(round, VoteType::Precommit)
    }

    fn get(&self, round: Round, vote_type: VoteType) -> Option<&VoteSet> {
        let sets = self.round_vote_sets.get(&round.as_u32()?)?;

        Some(match vote_type {
            VoteType::Prevote => &sets.prevotes,
            VoteType::Precommit => &sets.precommits,
        })
    }

    /// The recorded equivocation evidence.
    pub fn evidence(&self) -> &EvidenceMap {
        &self.evidence
    }
}
