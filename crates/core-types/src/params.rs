//! Consensus parameters recognized at runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Height, Round};

/// Block limits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParams {
    /// Maximum size of an encoded block, in bytes.
    pub max_bytes: u64,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            max_bytes: 21 * 1024 * 1024,
        }
    }
}

/// Evidence limits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceParams {
    /// Maximum age of evidence, in blocks.
    pub max_age_num_blocks: u64,

    /// Maximum age of evidence, in time.
    #[serde(with = "humantime_serde")]
    pub max_age_duration: Duration,

    /// Maximum total size of evidence in a block, in bytes.
    pub max_bytes: u64,
}

impl Default for EvidenceParams {
    fn default() -> Self {
        Self {
            max_age_num_blocks: 100_000,
            max_age_duration: Duration::from_secs(48 * 3600),
            max_bytes: 1024 * 1024,
        }
    }
}

/// Accepted validator key types.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorParams {
    /// Names of the accepted public key types.
    pub pub_key_types: Vec<String>,
}

impl Default for ValidatorParams {
    fn default() -> Self {
        Self {
            pub_key_types: vec!["ed25519".to_string()],
        }
    }
}

/// Protocol version parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionParams {
    /// The application protocol version.
    pub app_version: u64,
}

/// Proposer-based-timestamp synchrony bounds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronyParams {
    /// Bound on one-way message delay at round 0; doubles each round.
    #[serde(with = "humantime_serde")]
    pub message_delay: Duration,

    /// Bound on clock drift between correct validators.
    #[serde(with = "humantime_serde")]
    pub precision: Duration,
}

impl Default for SynchronyParams {
    fn default() -> Self {
        Self {
            message_delay: Duration::from_millis(500),
            precision: Duration::from_millis(505),
        }
    }
}

impl SynchronyParams {
    /// The message delay bound for the given round: the base delay doubled
    /// once per round, saturating.
    pub fn message_delay_for_round(&self, round: Round) -> Duration {
        let exp = round.as_i64().max(0).min(u32::MAX as i64) as u32;
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.message_delay.saturating_mul(factor)
    }
}

/// Consensus timeouts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutParams {
    /// How long to wait for a proposal before prevoting nil.
    #[serde(with = "humantime_serde")]
    pub propose: Duration,

    /// How much the propose timeout grows each round.
    #[serde(with = "humantime_serde")]
    pub propose_delta: Duration,

    /// How long to wait after a two-thirds-any vote threshold before
    /// moving on.
    #[serde(with = "humantime_serde")]
    pub vote: Duration,

    /// How much the vote timeout grows each round.
    #[serde(with = "humantime_serde")]
    pub vote_delta: Duration,

    /// How long to linger after a commit before starting the next height,
    /// to pick up straggler precommits.
    #[serde(with = "humantime_serde")]
    pub commit: Duration,

    /// Skip the commit timeout once precommits from every validator are in.
    pub bypass_commit_timeout: bool,
}

impl Default for TimeoutParams {
    fn default() -> Self {
        Self {
            propose: Duration::from_secs(3),
            propose_delta: Duration::from_millis(500),
            vote: Duration::from_secs(1),
            vote_delta: Duration::from_millis(500),
            commit: Duration::from_secs(1),
            bypass_commit_timeout: false,
        }
    }
}

impl TimeoutParams {
    /// The propose timeout for the given round.
    pub fn propose_for_round(&self, round: Round) -> Duration {
        let r = round.as_i64().max(0) as u32;
        self.propose + self.propose_delta.saturating_mul(r)
    }

    /// The vote timeout for the given round.
    pub fn vote_for_round(&self, round: Round) -> Duration {
        let r = round.as_i64().max(0) as u32;
        self.vote + self.vote_delta.saturating_mul(r)
    }
}

/// Application (ABCI) parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbciParams {
    /// Height at which vote extensions become mandatory; zero disables
    /// them entirely.
    pub vote_extensions_enable_height: Height,

    /// Whether the mempool rechecks transactions after every commit.
    pub recheck_tx: bool,
}

/// All consensus parameters recognized at runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Block limits.
    pub block: BlockParams,

    /// Evidence limits.
    pub evidence: EvidenceParams,

    /// Accepted validator key types.
    pub validator: ValidatorParams,

    /// Protocol version parameters.
    pub version: VersionParams,

    /// Proposer-based-timestamp synchrony bounds.
    pub synchrony: SynchronyParams,

    /// Consensus timeouts.
    pub timeout: TimeoutParams,

    /// Application parameters.
    pub abci: AbciParams,
}

impl ConsensusParams {
    /// Whether vote extensions are enabled at the given height.
    pub fn vote_extensions_enabled(&self, height: Height) -> bool {
        let enable = self.abci.vote_extensions_enable_height;
        enable > Height::ZERO && height >= enable
    }
}
