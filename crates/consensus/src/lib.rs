//! The tenderbft consensus state machine.
//!
//! A single driver task owns the [`RoundState`] and pulls from four input
//! streams: messages from peers, self-generated messages, timeout tocks and
//! the mempool's txs-available signal. Every input is logged to the
//! write-ahead log before it takes effect, making the machine
//! crash-recoverable without ever risking a double sign.

#![forbid(unsafe_code)]
#![deny(trivial_casts, trivial_numeric_casts)]
#![warn(
    missing_docs,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]

mod driver;
mod error;
mod events;
mod metrics;
mod msgs;
mod round_state;
mod signer;
mod ticker;
mod transitions;
mod wal;

pub use crate::driver::{Collaborators, Driver, DriverHandle};
pub use crate::error::ConsensusError;
pub use crate::events::{Event, EventBus, NoopEventBus};
pub use crate::metrics::Metrics;
pub use crate::msgs::{ConsensusMessage, MessageInfo, PeerId};
pub use crate::round_state::{RoundState, RoundStateEvent, Step};
pub use crate::signer::SignerGateway;
pub use crate::ticker::{TimeoutInfo, TimeoutTicker};
pub use crate::wal::{decode_message, encode_message, ConsensusWal, WalError, WalMessage};
