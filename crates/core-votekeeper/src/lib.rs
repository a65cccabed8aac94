//! Vote tallying over weighted validator sets: per-round vote sets with
//! two-thirds threshold and conflict detection, and the per-height keeper.

#![forbid(unsafe_code)]
#![deny(trivial_casts, trivial_numeric_casts)]
#![warn(
    missing_docs,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]

mod count;
mod evidence;
mod height_vote_set;
mod vote_set;

pub use crate::count::*;
pub use crate::evidence::*;
pub use crate::height_vote_set::*;
pub use crate::vote_set::*;

/// The weight of a vote, ie. the voting power behind it.
pub type Weight = tenderbft_core_types::VotingPower;
