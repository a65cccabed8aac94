//! The single-writer state of the current height and round.

use borsh::{BorshDeserialize, BorshSerialize};

use tenderbft_core_types::{
    Block, Height, PartSet, Round, SignedProposal, Timestamp, ValidatorSet,
};
use tenderbft_core_votekeeper::VoteSet;

/// The step the round state machine is at within a round.
///
/// Ordered by progression through the round: a later step never re-enters
/// an earlier one except through a round or height change.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub enum Step {
    /// Waiting out the commit timeout before starting the next height.
    NewHeight,

    /// A round has started but `Propose` has not been entered yet
    /// (possibly waiting for transactions).
    NewRound,

    /// Waiting for a complete proposal, or proposing.
    Propose,

    /// Prevote cast; tallying prevotes.
    Prevote,

    /// Two-thirds-any prevotes seen; waiting for a prevote majority.
    PrevoteWait,

    /// Precommit cast; tallying precommits.
    Precommit,

    /// Two-thirds-any precommits seen; waiting for a precommit majority.
    PrecommitWait,

    /// A block has a precommit majority; committing.
    Commit,
}

/// The mutable state of the consensus driver for the current height.
///
/// Only the driver task ever mutates this; observers get
/// [`RoundStateEvent`] snapshots.
pub struct RoundState {
    /// The height being decided.
    pub height: Height,

    /// The current round within the height.
    pub round: Round,

    /// The current step within the round.
    pub step: Step,

    /// When this height started (or will start, while in `NewHeight`).
    pub start_time: Timestamp,

    /// When the commit for this height was first reached.
    pub commit_time: Timestamp,

    /// The validator set for this height, with proposer priorities at the
    /// current round.
    pub validators: ValidatorSet,

    /// The validator set of the previous height.
    pub last_validators: ValidatorSet,

    /// The accepted proposal for the current round, if any.
    pub proposal: Option<SignedProposal>,

    /// Local receive time of the accepted proposal, for timeliness.
    pub proposal_receive_time: Timestamp,

    /// The reconstructed proposed block, once all parts are in.
    pub proposal_block: Option<Block>,

    /// Accumulator for the proposed block's parts.
    pub proposal_block_parts: Option<PartSet>,

    /// Round at which we locked, or nil.
    pub locked_round: Round,

    /// The block we are locked on.
    pub locked_block: Option<Block>,

    /// Parts of the locked block.
    pub locked_block_parts: Option<PartSet>,

    /// Most recent round with a proof of lock at or after our locked
    /// round, or nil.
    pub valid_round: Round,

    /// The block of the most recent proof of lock.
    pub valid_block: Option<Block>,

    /// Parts of the valid block.
    pub valid_block_parts: Option<PartSet>,

    /// Round whose precommits reached a majority for a block, nil until
    /// then. Set exactly once per height.
    pub commit_round: Round,

    /// Whether the precommit-wait timeout has been armed this round.
    pub triggered_timeout_precommit: bool,

    /// The precommits that justified the previous height.
    pub last_commit: Option<VoteSet>,
}

impl RoundState {
    /// Reset the per-round fields on entering `round`. Round 0 keeps the
    /// proposal fields, later rounds start from a clean slate.
    pub fn reset_for_round(&mut self, round: Round) {
        if round != Round::ZERO {
            self.proposal = None;
            self.proposal_receive_time = Timestamp::UNIX_EPOCH;
            self.proposal_block = None;
            self.proposal_block_parts = None;
        }

        self.round = round;
        self.triggered_timeout_precommit = false;
    }

    /// A deterministic snapshot of the state for observers.
    pub fn event(&self) -> RoundStateEvent {
        RoundStateEvent {
            height: self.height,
            round: self.round,
            step: self.step,
            start_time: self.start_time,
        }
    }
}

/// Immutable snapshot of the round state, published on every step change
/// and recorded in the write-ahead log.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RoundStateEvent {
    /// The height being decided.
    pub height: Height,

    /// The current round.
    pub round: Round,

    /// The current step.
    pub step: Step,

    /// When this height started.
    pub start_time: Timestamp,
}
