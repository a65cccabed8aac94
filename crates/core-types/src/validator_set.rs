use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{Address, Hash, PublicKey, VotingPower};

/// A consensus validator: identity, voting power, and its current proposer
/// priority.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Validator {
    /// The validator's address.
    pub address: Address,

    /// The validator's public key.
    pub pub_key: PublicKey,

    /// The validator's voting power.
    pub voting_power: VotingPower,

    /// Rotating priority driving proposer selection.
    pub proposer_priority: i64,
}

impl Validator {
    /// Create a new validator with zero proposer priority.
    pub fn new(pub_key: PublicKey, voting_power: VotingPower) -> Self {
        Self {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }
}

/// An ordered, weighted validator set with deterministic proposer rotation.
///
/// Validators are kept sorted by address. Rotation follows the classic
/// priority scheme: each round every priority grows by the validator's
/// power, the highest priority proposes, and the proposer's priority drops
/// by the total power. Ties break toward the smallest address.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_voting_power: VotingPower,
    proposer_index: Option<u32>,
}

impl ValidatorSet {
    /// Create a new validator set from the given validators.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        validators.dedup_by(|a, b| a.address == b.address);

        let total_voting_power = validators.iter().map(|v| v.voting_power).sum();

        Self {
            validators,
            total_voting_power,
            proposer_index: None,
        }
    }

    /// Number of validators in the set.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Sum of all validators' voting power.
    pub fn total_voting_power(&self) -> VotingPower {
        self.total_voting_power
    }

    /// Iterate over the validators in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    /// Look up a validator and its index by address.
    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.validators
            .iter()
            .position(|v| &v.address == address)
            .map(|index| (index as u32, &self.validators[index]))
    }

    /// Look up a validator by index.
    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    /// Whether the given address belongs to the set.
    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// The current proposer.
    ///
    /// Before any rotation this is the highest-priority validator (the
    /// smallest address when all priorities are equal).
    pub fn proposer(&self) -> &Validator {
        if let Some(index) = self.proposer_index {
            return &self.validators[index as usize];
        }

        self.highest_priority().1
    }

    /// Advance proposer rotation by the given number of rounds.
    pub fn advance_proposer_priority(&mut self, rounds: u32) {
        assert!(!self.validators.is_empty(), "empty validator set");

        for _ in 0..rounds {
            for validator in &mut self.validators {
                validator.proposer_priority = validator
                    .proposer_priority
                    .checked_add(validator.voting_power as i64)
                    .expect("proposer priority overflow");
            }

            let (index, _) = self.highest_priority();
            self.validators[index].proposer_priority -= self.total_voting_power as i64;
            self.proposer_index = Some(index as u32);
        }
    }

    fn highest_priority(&self) -> (usize, &Validator) {
        self.validators
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.proposer_priority
                    .cmp(&b.proposer_priority)
                    // sorted by address, so the earlier index is the
                    // smaller address
                    .then(b.address.cmp(&a.address))
            })
            .expect("empty validator set")
    }

    /// A digest of the set's membership and powers, independent of the
    /// rotation state.
    pub fn hash(&self) -> Hash {
        let entries: Vec<(Address, PublicKey, VotingPower)> = self
            .validators
            .iter()
            .map(|v| (v.address, v.pub_key, v.voting_power))
            .collect();

        let bytes = borsh::to_vec(&entries).expect("validator set encoding cannot fail");
        Hash::digest(bytes)
    }
}

impl fmt::Debug for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorSet")
            .field("len", &self.validators.len())
            .field("total_voting_power", &self.total_voting_power)
            .finish()
    }
}
