//! Block parts and the accumulator that reassembles them.

use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use bytes::Bytes;
use thiserror::Error;

use crate::merkle::{self, Proof, ProofError};
use crate::PartSetHeader;

/// Size of a block part. Every part except possibly the last is exactly
/// this long.
pub const BLOCK_PART_SIZE: usize = 65536;

/// One fixed-size chunk of an encoded block, with its inclusion proof
/// against the part set root.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Part {
    /// Index of this part, 0-based.
    pub index: u32,

    /// The chunk of the encoded block.
    pub bytes: Bytes,

    /// Inclusion proof against the part set's root hash.
    pub proof: Proof,
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("index", &self.index)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Reasons a part is rejected by [`PartSet::add_part`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PartSetError {
    /// The part index is outside `0..total`.
    #[error("part index {index} out of bounds (total {total})")]
    IndexOutOfBounds {
        /// The offending index.
        index: u32,
        /// The set's total.
        total: u32,
    },

    /// The part's Merkle proof does not verify against the set's root.
    #[error("invalid part proof: {0}")]
    InvalidProof(#[from] ProofError),

    /// A different part is already present at this index.
    #[error("conflicting part at index {0}")]
    Conflict(u32),
}

/// Accumulator for the ordered parts covering one encoded block.
///
/// A complete set reconstructs exactly one byte string whose hash equals the
/// part set header the accumulator was created from.
#[derive(Clone, Debug)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
    byte_size: u64,
}

impl PartSet {
    /// Split encoded data into parts and build their proofs.
    pub fn from_data(data: Bytes) -> Self {
        let chunks: Vec<Bytes> = if data.is_empty() {
            vec![Bytes::new()]
        } else {
            (0..data.len())
                .step_by(BLOCK_PART_SIZE)
                .map(|start| data.slice(start..(start + BLOCK_PART_SIZE).min(data.len())))
                .collect()
        };

        let (root, proofs) = merkle::proofs(&chunks);
        let total = chunks.len() as u32;

        let parts: Vec<Option<Part>> = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (bytes, proof))| {
                Some(Part {
                    index: index as u32,
                    bytes,
                    proof,
                })
            })
            .collect();

        let byte_size = parts
            .iter()
            .flatten()
            .map(|part| part.bytes.len() as u64)
            .sum();

        Self {
            header: PartSetHeader::new(total, root),
            parts,
            count: total,
            byte_size,
        }
    }

    /// An empty accumulator expecting parts matching the given header.
    pub fn from_header(header: PartSetHeader) -> Self {
        Self {
            parts: vec![None; header.total as usize],
            header,
            count: 0,
            byte_size: 0,
        }
    }

    /// The header this set accumulates against.
    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    /// Whether the set matches the given header.
    pub fn has_header(&self, header: PartSetHeader) -> bool {
        self.header == header
    }

    /// Number of parts received so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Total number of parts expected.
    pub fn total(&self) -> u32 {
        self.header.total
    }

    /// Sum of the received parts' sizes in bytes.
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Whether every part has been received.
    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    /// Get the part at `index`, if received.
    pub fn part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(Option::as_ref)
    }

    /// Add a part after verifying its proof against the set's root.
    ///
    /// Returns `Ok(false)` if the identical part was already present.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        if part.index >= self.header.total {
            return Err(PartSetError::IndexOutOfBounds {
                index: part.index,
                total: self.header.total,
            });
        }

        if let Some(existing) = &self.parts[part.index as usize] {
            if existing == &part {
                return Ok(false);
            }
            return Err(PartSetError::Conflict(part.index));
        }

        part.proof.verify(&self.header.hash, &part.bytes)?;

        let index = part.index as usize;
        self.count += 1;
        self.byte_size += part.bytes.len() as u64;
        self.parts[index] = Some(part);

        Ok(true)
    }

    /// Concatenate the parts into the encoded block. `None` until complete.
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }

        let mut data = Vec::with_capacity(self.byte_size as usize);
        for part in self.parts.iter().flatten() {
            data.extend_from_slice(&part.bytes);
        }

        Some(Bytes::from(data))
    }

    /// Iterate over the received parts in index order.
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().flatten()
    }
}
