use thiserror::Error;

use tenderbft_core_types::{Address, BoxError, Height, Round, SignerError};

use crate::wal::WalError;

/// Errors surfaced by the consensus driver.
///
/// Invalid peer messages are logged and swallowed inside the handlers;
/// everything that reaches this type is either operational (WAL, signer,
/// stores) or a reason to stop the node.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Write-ahead log failure.
    #[error("wal: {0}")]
    Wal(#[from] WalError),

    /// A self-generated message could not be made durable. Continuing
    /// would risk equivocation after a restart.
    #[error("failed to append internal message to wal: {0}")]
    InternalWalAppend(#[source] WalError),

    /// Signer failure that is not a per-round refusal.
    #[error("signer: {0}")]
    Signer(#[from] SignerError),

    /// The chain state could not be loaded.
    #[error("state store: {0}")]
    StateStore(#[source] BoxError),

    /// Our key signed a recent commit; starting would risk double-signing.
    #[error("our key signed the commit at height {height}; refusing to start (address {address})")]
    DoubleSignRisk {
        /// The height with our signature.
        height: Height,
        /// Our validator address.
        address: Address,
    },

    /// A vote signed by our own key conflicts with one we already cast.
    #[error("conflicting vote from ourselves at height {height}, round {round}")]
    SelfConflictingVote {
        /// The height of the conflict.
        height: Height,
        /// The round of the conflict.
        round: Round,
    },

    /// The driver is no longer accepting input.
    #[error("consensus driver stopped")]
    DriverStopped,
}
