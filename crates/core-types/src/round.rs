use core::cmp::Ordering;
use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// A round number within a height.
///
/// `Nil` stands for "no round" (the −1 sentinel used for `pol_round`,
/// `locked_round`, `valid_round` and the commit round before a decision),
/// and orders before every defined round.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub enum Round {
    /// No round, ie. −1.
    Nil,

    /// A defined round, 0 or greater.
    Some(u32),
}

impl Round {
    /// Round zero, the first round of every height.
    pub const ZERO: Self = Self::Some(0);

    /// Create a new round.
    pub const fn new(round: u32) -> Self {
        Self::Some(round)
    }

    /// The round as a signed integer, with `Nil` mapping to −1.
    pub const fn as_i64(&self) -> i64 {
        match self {
            Round::Nil => -1,
            Round::Some(r) => *r as i64,
        }
    }

    /// The round number, if defined.
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Round::Nil => None,
            Round::Some(r) => Some(*r),
        }
    }

    /// Whether the round is defined, ie. not `Nil`.
    pub const fn is_defined(&self) -> bool {
        matches!(self, Round::Some(_))
    }

    /// Whether the round is `Nil`.
    pub const fn is_nil(&self) -> bool {
        matches!(self, Round::Nil)
    }

    /// The next round. Incrementing `Nil` yields round 0.
    pub fn increment(&self) -> Self {
        match self {
            Round::Nil => Round::Some(0),
            Round::Some(r) => Round::Some(r + 1),
        }
    }
}

impl PartialOrd for Round {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Round {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_i64().cmp(&other.as_i64())
    }
}

impl From<i64> for Round {
    fn from(round: i64) -> Self {
        if round < 0 {
            Round::Nil
        } else {
            Round::Some(round as u32)
        }
    }
}

impl From<u32> for Round {
    fn from(round: u32) -> Self {
        Round::Some(round)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_i64().fmt(f)
    }
}

impl fmt::Debug for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Round({})", self.as_i64())
    }
}
