//! The messages flowing into the driver.

use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};

use tenderbft_core_types::{Height, Part, Round, SignedProposal, SignedVote, Timestamp};

/// Identifies the peer a message came from.
#[derive(Clone, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// A consensus message: a proposal, one part of a proposed block, or a
/// vote.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum ConsensusMessage {
    /// A signed proposal.
    Proposal(SignedProposal),

    /// One part of the proposed block for the given height and round.
    BlockPart {
        /// Height the part belongs to.
        height: Height,

        /// Round the part was proposed in.
        round: Round,

        /// The part itself.
        part: Part,
    },

    /// A signed vote.
    Vote(SignedVote),
}

impl ConsensusMessage {
    /// The height this message is for.
    pub fn height(&self) -> Height {
        match self {
            ConsensusMessage::Proposal(p) => p.proposal.height,
            ConsensusMessage::BlockPart { height, .. } => *height,
            ConsensusMessage::Vote(v) => v.vote.height,
        }
    }
}

/// A consensus message with its provenance: the peer it came from (`None`
/// for self-generated messages) and the local receive time.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct MessageInfo {
    /// The message.
    pub msg: ConsensusMessage,

    /// Originating peer; `None` when self-generated.
    pub peer_id: Option<PeerId>,

    /// Local wall-clock time the message was received.
    pub receive_time: Timestamp,
}

impl MessageInfo {
    /// Wrap a message received from a peer.
    pub fn from_peer(msg: ConsensusMessage, peer_id: PeerId, receive_time: Timestamp) -> Self {
        Self {
            msg,
            peer_id: Some(peer_id),
            receive_time,
        }
    }

    /// Wrap a self-generated message.
    pub fn internal(msg: ConsensusMessage, receive_time: Timestamp) -> Self {
        Self {
            msg,
            peer_id: None,
            receive_time,
        }
    }

    /// Whether the message is self-generated.
    pub fn is_internal(&self) -> bool {
        self.peer_id.is_none()
    }
}
