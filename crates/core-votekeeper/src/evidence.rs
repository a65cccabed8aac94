//! Evidence of equivocation.

use std::collections::BTreeMap;

use tenderbft_core_types::{Address, SignedVote};

/// Keeps track of evidence of equivocation: pairs of conflicting votes
/// submitted by the same validator at the same height, round and type.
#[derive(Clone, Debug, Default)]
pub struct EvidenceMap {
    map: BTreeMap<Address, Vec<(SignedVote, SignedVote)>>,
}

impl EvidenceMap {
    /// Create a new `EvidenceMap` instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return whether or not there is any evidence of equivocation.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Return the evidence of equivocation for a given address, if any.
    pub fn get(&self, address: &Address) -> Option<&Vec<(SignedVote, SignedVote)>> {
        self.map.get(address)
    }

    /// Add evidence of equivocating votes.
    ///
    /// # Precondition
    /// - Panics if the two conflicting votes were not cast by the same
    ///   validator.
    pub fn add(&mut self, existing: SignedVote, conflicting: SignedVote) {
        debug_assert_eq!(
            existing.validator_address(),
            conflicting.validator_address()
        );

        self.map
            .entry(*conflicting.validator_address())
            .or_default()
            .push((existing, conflicting));
    }
}
