//! Write-ahead log for the tenderbft consensus core.
//!
//! A [`Log`] is an append-only file of CRC32-framed entries. Appends land in
//! the OS page cache; [`Log::sync`] forces them to stable storage. The file
//! is held under an exclusive advisory lock for the lifetime of the handle.
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! +----------------+----------------+------------------+
//! | crc32 (4 bytes)| length (4 bytes)| data (length)   |
//! +----------------+----------------+------------------+
//! ```

#![forbid(unsafe_code)]
#![deny(trivial_casts, trivial_numeric_casts)]
#![warn(
    missing_docs,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]

mod log;
mod repair;

pub use crate::log::{Log, LogError, LogIter};
pub use crate::repair::{repair, RepairOutcome};
