use crate::VotingPower;

/// A quorum threshold as a fraction of the total voting power. The
/// threshold is met when `weight > (numerator / denominator) × total`,
/// strictly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThresholdParam {
    /// Numerator of the threshold fraction.
    pub numerator: u64,

    /// Denominator of the threshold fraction.
    pub denominator: u64,
}

impl ThresholdParam {
    /// More than two thirds of the total weight, the quorum threshold.
    pub const TWO_THIRDS: Self = Self::new(2, 3);

    /// More than one third of the total weight: at least one honest
    /// validator is represented.
    pub const ONE_THIRD: Self = Self::new(1, 3);

    /// Create a new threshold parameter.
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Check whether the threshold is met.
    pub fn is_met(&self, weight: VotingPower, total: VotingPower) -> bool {
        let lhs = weight
            .checked_mul(self.denominator)
            .expect("attempt to multiply with overflow");

        let rhs = total
            .checked_mul(self.numerator)
            .expect("attempt to multiply with overflow");

        lhs > rhs
    }

    /// The minimum weight meeting the threshold for the given total.
    pub fn min_expected(&self, total: VotingPower) -> VotingPower {
        1 + total
            .checked_mul(self.numerator)
            .expect("attempt to multiply with overflow")
            / self.denominator
    }
}

/// The pair of thresholds the core works with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThresholdParams {
    /// Threshold for a quorum (default: more than two thirds).
    pub quorum: ThresholdParam,

    /// Threshold guaranteeing at least one honest validator (default:
    /// more than one third).
    pub honest: ThresholdParam,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self {
            quorum: ThresholdParam::TWO_THIRDS,
            honest: ThresholdParam::ONE_THIRD,
        }
    }
}
