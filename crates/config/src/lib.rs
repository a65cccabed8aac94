//! Node-level configuration for the tenderbft consensus core.
//!
//! Chain-wide consensus parameters (timeouts, synchrony bounds, block
//! limits) travel in the chain state; this crate covers the knobs that are
//! local to one node.

#![forbid(unsafe_code)]
#![deny(trivial_casts, trivial_numeric_casts)]
#![warn(
    missing_docs,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Consensus configuration options local to this node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Path of the write-ahead log file.
    pub wal_path: PathBuf,

    /// Whether to propose blocks with no transactions.
    pub create_empty_blocks: bool,

    /// How long to wait before proposing an empty block anyway. Zero means
    /// wait indefinitely for transactions (when `create_empty_blocks` is
    /// off) or propose immediately (when it is on).
    #[serde(with = "humantime_serde")]
    pub create_empty_blocks_interval: Duration,

    /// How many recent blocks to scan for our own signature before
    /// starting. A hit means this key was recently validating elsewhere and
    /// starting up would risk double-signing. Zero disables the check.
    pub double_sign_check_height: u64,

    /// Capacity of the queue for messages from peers.
    pub peer_queue_capacity: usize,

    /// Capacity of the queue for self-generated messages.
    pub internal_queue_capacity: usize,
}

impl ConsensusConfig {
    /// Whether entering `Propose` at round 0 should wait for transactions.
    pub fn wait_for_txs(&self) -> bool {
        !self.create_empty_blocks || self.create_empty_blocks_interval > Duration::ZERO
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            wal_path: PathBuf::from("data/cs.wal"),
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
            double_sign_check_height: 0,
            peer_queue_capacity: 1000,
            internal_queue_capacity: 1000,
        }
    }
}
