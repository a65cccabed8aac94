use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// A blockchain height, starting at the chain's initial height and
/// monotonically increasing by one per committed block.
#[derive(
    Copy,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct Height(u64);

impl Height {
    /// Height zero, ie. "no block committed yet".
    pub const ZERO: Self = Self(0);

    /// Create a new height.
    pub const fn new(height: u64) -> Self {
        Self(height)
    }

    /// The height as a plain integer.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The next height.
    pub fn increment(&self) -> Self {
        Self(self.0 + 1)
    }

    /// The previous height, or `None` at height zero.
    pub fn decrement(&self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }

    /// The height `n` below this one, saturating at zero.
    pub fn decrement_by(&self, n: u64) -> Self {
        Self(self.0.saturating_sub(n))
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Height({})", self.0)
    }
}

impl From<u64> for Height {
    fn from(height: u64) -> Self {
        Self(height)
    }
}
