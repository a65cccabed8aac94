use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use byteorder::{WriteBytesExt, BE};

use crate::{Address, BlockId, Height, Round, Signature, Timestamp};

/// A proposal for a block at a given height and round.
///
/// `pol_round` is the round of the proof of lock justifying a re-proposal,
/// or nil for a fresh proposal. The block itself travels as parts; the
/// proposal only pins its identity.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Proposal {
    /// The height this proposal is for.
    pub height: Height,

    /// The round this proposal is for.
    pub round: Round,

    /// Round of the proof of lock, or nil.
    pub pol_round: Round,

    /// Identity of the proposed block.
    pub block_id: BlockId,

    /// The proposer's block time. Must equal the proposed block's header
    /// time.
    pub timestamp: Timestamp,

    /// Address of the proposer.
    pub proposer_address: Address,
}

impl Proposal {
    /// Create a new proposal.
    pub fn new(
        height: Height,
        round: Round,
        pol_round: Round,
        block_id: BlockId,
        timestamp: Timestamp,
        proposer_address: Address,
    ) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp,
            proposer_address,
        }
    }

    /// Structural validity: a defined round, and a POL round that is either
    /// nil or an earlier round.
    pub fn is_well_formed(&self) -> bool {
        self.round.is_defined() && self.pol_round < self.round && !self.block_id.is_nil()
    }

    /// The canonical bytes covered by the proposal signature.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);

        buf.write_u64::<BE>(chain_id.len() as u64).unwrap();
        buf.extend_from_slice(chain_id.as_bytes());
        buf.write_u8(0x20).unwrap();
        buf.write_u64::<BE>(self.height.as_u64()).unwrap();
        buf.write_i64::<BE>(self.round.as_i64()).unwrap();
        buf.write_i64::<BE>(self.pol_round.as_i64()).unwrap();
        buf.extend_from_slice(self.block_id.hash.as_bytes());
        buf.write_u32::<BE>(self.block_id.part_set_header.total)
            .unwrap();
        buf.extend_from_slice(self.block_id.part_set_header.hash.as_bytes());
        buf.write_u64::<BE>(self.timestamp.unix_nanos()).unwrap();

        buf
    }
}

impl fmt::Debug for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal(h={} r={} pol={} {} by {})",
            self.height, self.round, self.pol_round, self.block_id, self.proposer_address
        )
    }
}

/// A proposal together with the proposer's signature.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct SignedProposal {
    /// The proposal.
    pub proposal: Proposal,

    /// Signature over [`Proposal::sign_bytes`].
    pub signature: Signature,
}

impl SignedProposal {
    /// Create a new signed proposal.
    pub fn new(proposal: Proposal, signature: Signature) -> Self {
        Self {
            proposal,
            signature,
        }
    }
}
