//! Test harness for the tenderbft consensus core: in-memory collaborators,
//! a deterministic fixture of validators, and helpers to drive the
//! consensus driver by hand.

#![forbid(unsafe_code)]
#![deny(trivial_casts, trivial_numeric_casts)]

mod events;
mod executor;
mod notifier;
mod signer;
mod store;

pub use crate::events::*;
pub use crate::executor::*;
pub use crate::fixture::*;
pub use crate::notifier::*;
pub use crate::signer::*;
pub use crate::store::*;
