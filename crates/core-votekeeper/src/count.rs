//! Weighted tallies keyed by block ID.

use std::collections::BTreeMap;

use tenderbft_core_types::BlockId;

use crate::Weight;

/// A tally of weight per value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValuesWeights<Value> {
    value_weights: BTreeMap<Value, Weight>,
}

impl<Value> ValuesWeights<Value>
where
    Value: Ord,
{
    /// Create an empty tally.
    pub fn new() -> Self {
        Self {
            value_weights: BTreeMap::new(),
        }
    }

    /// Add weight to a value and return its new total.
    pub fn add_weight(&mut self, value: Value, weight: Weight) -> Weight {
        let entry = self.value_weights.entry(value).or_insert(0);
        *entry += weight;
        *entry
    }

    /// The weight tallied for a value.
    pub fn get(&self, value: &Value) -> Weight {
        self.value_weights.get(value).copied().unwrap_or(0)
    }

    /// The value with the highest tallied weight, if any.
    pub fn highest_weighted_value(&self) -> Option<(&Value, Weight)> {
        self.value_weights
            .iter()
            .max_by_key(|(_, weight)| *weight)
            .map(|(value, weight)| (value, *weight))
    }
}

/// Tallies votes of one type at one (height, round): weight per block ID
/// (nil included, under the nil block ID) plus the total accepted weight.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoteCount {
    block_weights: ValuesWeights<BlockId>,
    sum: Weight,
}

impl VoteCount {
    /// Create an empty count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tally a vote for the given block ID with the given weight and return
    /// the block's new total.
    pub fn add(&mut self, block_id: BlockId, weight: Weight) -> Weight {
        self.sum += weight;
        self.block_weights.add_weight(block_id, weight)
    }

    /// The weight tallied for a block ID.
    pub fn get(&self, block_id: &BlockId) -> Weight {
        self.block_weights.get(block_id)
    }

    /// The total weight of all accepted votes.
    pub fn sum(&self) -> Weight {
        self.sum
    }

    /// The block ID with the highest tallied weight, if any.
    pub fn highest_weighted(&self) -> Option<(&BlockId, Weight)> {
        self.block_weights.highest_weighted_value()
    }
}
