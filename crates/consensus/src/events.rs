//! Events published by the driver on the event bus.

use tenderbft_core_types::{Address, BlockId, Height, Round, SignedVote};

use crate::round_state::RoundStateEvent;

/// An observable consensus event.
///
/// Events are snapshots: they never borrow from the live round state.
#[derive(Clone, Debug)]
pub enum Event {
    /// The step changed.
    NewRoundStep(RoundStateEvent),

    /// A new round started.
    NewRound {
        /// The height.
        height: Height,
        /// The new round.
        round: Round,
        /// The proposer of the new round.
        proposer: Address,
    },

    /// A proposal and its full block are available.
    CompleteProposal {
        /// The height.
        height: Height,
        /// The round.
        round: Round,
        /// The proposed block.
        block_id: BlockId,
    },

    /// More than two thirds of prevotes named one block.
    Polka {
        /// The height.
        height: Height,
        /// The round of the prevotes.
        round: Round,
        /// The block the polka is for.
        block_id: BlockId,
    },

    /// A vote was accepted into a vote set.
    Vote(SignedVote),

    /// The valid block was updated.
    ValidBlock(RoundStateEvent),

    /// We locked on a block.
    Lock(RoundStateEvent),

    /// We re-locked on the block we were already locked on, at a later
    /// round.
    Relock(RoundStateEvent),

    /// The propose timeout fired without a complete proposal.
    TimeoutPropose(RoundStateEvent),

    /// A vote-wait timeout fired.
    TimeoutWait(RoundStateEvent),
}

/// Sink for consensus events, typically bridging to the reactor and RPC
/// subscribers. Publishing must not block the driver.
pub trait EventBus: Send + Sync {
    /// Publish an event.
    fn publish(&self, event: Event);
}

/// An event bus that drops everything.
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn publish(&self, _event: Event) {}
}
