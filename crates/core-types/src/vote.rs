use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use byteorder::{WriteBytesExt, BE};
use bytes::Bytes;

use crate::{Address, BlockId, Height, Round, Signature, Timestamp};

/// The two vote types of the two-phase commit.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, BorshSerialize, BorshDeserialize,
)]
pub enum VoteType {
    /// First phase: votes that establish a proof of lock.
    Prevote,

    /// Second phase: votes that commit a block.
    Precommit,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "prevote"),
            VoteType::Precommit => write!(f, "precommit"),
        }
    }
}

/// A vote for a block (or nil) at a given height, round and phase.
///
/// `extension` is non-empty only on non-nil precommits at heights where
/// vote extensions are enabled.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Vote {
    /// The vote type.
    pub vote_type: VoteType,

    /// The height this vote is for.
    pub height: Height,

    /// The round this vote is for.
    pub round: Round,

    /// The voted block, or [`BlockId::nil`] for a nil vote.
    pub block_id: BlockId,

    /// The voter's local time when casting.
    pub timestamp: Timestamp,

    /// Address of the voting validator.
    pub validator_address: Address,

    /// Index of the voting validator in the validator set.
    pub validator_index: u32,

    /// Application-supplied vote extension data.
    pub extension: Bytes,
}

impl Vote {
    /// Create a new prevote.
    pub fn new_prevote(
        height: Height,
        round: Round,
        block_id: BlockId,
        validator_address: Address,
        validator_index: u32,
    ) -> Self {
        Self {
            vote_type: VoteType::Prevote,
            height,
            round,
            block_id,
            timestamp: Timestamp::UNIX_EPOCH,
            validator_address,
            validator_index,
            extension: Bytes::new(),
        }
    }

    /// Create a new precommit.
    pub fn new_precommit(
        height: Height,
        round: Round,
        block_id: BlockId,
        validator_address: Address,
        validator_index: u32,
    ) -> Self {
        Self {
            vote_type: VoteType::Precommit,
            height,
            round,
            block_id,
            timestamp: Timestamp::UNIX_EPOCH,
            validator_address,
            validator_index,
            extension: Bytes::new(),
        }
    }

    /// Set the timestamp.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the extension data.
    pub fn with_extension(mut self, extension: Bytes) -> Self {
        self.extension = extension;
        self
    }

    /// Whether this is a nil vote.
    pub fn is_nil(&self) -> bool {
        self.block_id.is_nil()
    }

    /// The canonical bytes covered by the vote signature.
    ///
    /// The extension is deliberately not covered: it carries its own
    /// signature so that commits can be stripped of extension data without
    /// invalidating the vote signatures.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);

        buf.write_u64::<BE>(chain_id.len() as u64).unwrap();
        buf.extend_from_slice(chain_id.as_bytes());
        buf.write_u8(match self.vote_type {
            VoteType::Prevote => 1,
            VoteType::Precommit => 2,
        })
        .unwrap();
        buf.write_u64::<BE>(self.height.as_u64()).unwrap();
        buf.write_i64::<BE>(self.round.as_i64()).unwrap();
        buf.extend_from_slice(self.block_id.hash.as_bytes());
        buf.write_u32::<BE>(self.block_id.part_set_header.total)
            .unwrap();
        buf.extend_from_slice(self.block_id.part_set_header.hash.as_bytes());
        buf.write_u64::<BE>(self.timestamp.unix_nanos()).unwrap();

        buf
    }

    /// The canonical bytes covered by the extension signature.
    pub fn extension_sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.extension.len());

        buf.write_u64::<BE>(chain_id.len() as u64).unwrap();
        buf.extend_from_slice(chain_id.as_bytes());
        buf.write_u64::<BE>(self.height.as_u64()).unwrap();
        buf.write_i64::<BE>(self.round.as_i64()).unwrap();
        buf.write_u64::<BE>(self.extension.len() as u64).unwrap();
        buf.extend_from_slice(&self.extension);

        buf
    }
}

impl fmt::Debug for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote({} h={} r={} {} by {})",
            self.vote_type, self.height, self.round, self.block_id, self.validator_address
        )
    }
}

/// A vote together with its signature and, when extensions are in play,
/// the signature over the extension data.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct SignedVote {
    /// The vote.
    pub vote: Vote,

    /// Signature over [`Vote::sign_bytes`].
    pub signature: Signature,

    /// Signature over [`Vote::extension_sign_bytes`], present on non-nil
    /// precommits when vote extensions are enabled.
    pub extension_signature: Option<Signature>,
}

impl SignedVote {
    /// Create a new signed vote without an extension signature.
    pub fn new(vote: Vote, signature: Signature) -> Self {
        Self {
            vote,
            signature,
            extension_signature: None,
        }
    }

    /// Attach an extension signature.
    pub fn with_extension_signature(mut self, signature: Signature) -> Self {
        self.extension_signature = Some(signature);
        self
    }

    /// Address of the voting validator.
    pub fn validator_address(&self) -> &Address {
        &self.vote.validator_address
    }

    /// Drop extension data and its signature, for heights where extensions
    /// are disabled.
    pub fn strip_extension(mut self) -> Self {
        self.vote.extension = Bytes::new();
        self.extension_signature = None;
        self
    }
}
