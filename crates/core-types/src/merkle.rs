//! Merkle trees over byte slices, with inclusion proofs.
//!
//! Leaves and inner nodes are domain-separated (RFC 6962 style) so a leaf
//! can never be confused with an inner node.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::Hash;

const LEAF_PREFIX: u8 = 0x00;
const INNER_PREFIX: u8 = 0x01;

/// Hash of a leaf.
pub fn leaf_hash(leaf: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    Hash::new(hasher.finalize().into())
}

/// Hash of an inner node.
pub fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash::new(hasher.finalize().into())
}

/// The largest power of two strictly less than `n`. `n` must be ≥ 2.
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

fn hash_leaves(leaf_hashes: &[Hash]) -> Hash {
    match leaf_hashes {
        [] => Hash::digest([]),
        [single] => *single,
        _ => {
            let k = split_point(leaf_hashes.len());
            let left = hash_leaves(&leaf_hashes[..k]);
            let right = hash_leaves(&leaf_hashes[k..]);
            inner_hash(&left, &right)
        }
    }
}

/// The Merkle root over the given items.
pub fn root_hash<T: AsRef<[u8]>>(items: &[T]) -> Hash {
    let leaves: Vec<Hash> = items.iter().map(|item| leaf_hash(item.as_ref())).collect();
    hash_leaves(&leaves)
}

/// An inclusion proof for a single leaf.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Proof {
    /// Total number of leaves in the tree.
    pub total: u32,

    /// Index of the proven leaf.
    pub index: u32,

    /// Hash of the proven leaf.
    pub leaf_hash: Hash,

    /// Sibling hashes bottom-up.
    pub aunts: Vec<Hash>,
}

/// Reasons a proof can fail verification.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProofError {
    /// The leaf does not hash to the proof's leaf hash.
    #[error("leaf hash mismatch")]
    LeafMismatch,

    /// The computed root does not match the expected root.
    #[error("root hash mismatch")]
    RootMismatch,

    /// The proof shape is inconsistent with its total/index.
    #[error("malformed proof")]
    Malformed,
}

impl Proof {
    /// Verify that `leaf` is the `index`-th of `total` leaves under `root`.
    pub fn verify(&self, root: &Hash, leaf: &[u8]) -> Result<(), ProofError> {
        if leaf_hash(leaf) != self.leaf_hash {
            return Err(ProofError::LeafMismatch);
        }

        let computed = self.compute_root()?;
        if &computed != root {
            return Err(ProofError::RootMismatch);
        }

        Ok(())
    }

    fn compute_root(&self) -> Result<Hash, ProofError> {
        compute_root_from_aunts(
            self.index as usize,
            self.total as usize,
            self.leaf_hash,
            &self.aunts,
        )
        .ok_or(ProofError::Malformed)
    }
}

fn compute_root_from_aunts(
    index: usize,
    total: usize,
    leaf: Hash,
    aunts: &[Hash],
) -> Option<Hash> {
    match total {
        0 => None,
        1 => aunts.is_empty().then_some(leaf),
        _ => {
            let (aunt, rest) = aunts.split_last()?;
            let k = split_point(total);

            if index < k {
                let left = compute_root_from_aunts(index, k, leaf, rest)?;
                Some(inner_hash(&left, aunt))
            } else {
                let right = compute_root_from_aunts(index - k, total - k, leaf, rest)?;
                Some(inner_hash(aunt, &right))
            }
        }
    }
}

/// Build the root and one inclusion proof per item.
pub fn proofs<T: AsRef<[u8]>>(items: &[T]) -> (Hash, Vec<Proof>) {
    let leaves: Vec<Hash> = items.iter().map(|item| leaf_hash(item.as_ref())).collect();
    let total = leaves.len();

    let mut proofs: Vec<Proof> = leaves
        .iter()
        .enumerate()
        .map(|(index, leaf)| Proof {
            total: total as u32,
            index: index as u32,
            leaf_hash: *leaf,
            aunts: Vec::new(),
        })
        .collect();

    let root = build_proofs(&leaves, &mut proofs, 0);
    (root, proofs)
}

// Fills in the aunts top-down: recursion appends the sibling subtree root to
// every proof on the opposite side, so each proof ends up with its aunts
// ordered bottom-up.
fn build_proofs(leaves: &[Hash], proofs: &mut [Proof], offset: usize) -> Hash {
    match leaves {
        [] => Hash::digest([]),
        [single] => *single,
        _ => {
            let k = split_point(leaves.len());
            let left = build_proofs(&leaves[..k], proofs, offset);
            let right = build_proofs(&leaves[k..], proofs, offset + k);

            for proof in &mut proofs[offset..offset + k] {
                proof.aunts.push(right);
            }
            for proof in &mut proofs[offset + k..offset + leaves.len()] {
                proof.aunts.push(left);
            }

            inner_hash(&left, &right)
        }
    }
}
