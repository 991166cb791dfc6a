//! Authenticated directory tree.
//!
//! A sparse Merkle tree over the full 256-bit index space. Every index maps
//! to a fixed leaf slot; absent slots hash to a per-height empty value, so
//! the tree supports both inclusion and non-inclusion proofs against a
//! single root. Proof bytes are opaque to callers: providers attach them to
//! lookup proofs and clients hand them back to [`verify`].

use crypto::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The tree covers the whole VRF output space.
const DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Failed to decode tree proof ({0})")]
    DecodeError(String),

    #[error("Tree proof is malformed: {0}")]
    MalformedProof(String),

    #[error("Tree proof does not match the ratified root")]
    RootMismatch,
}

/// The directory tree held by the provider: index -> leaf digest.
#[derive(Default, Clone)]
pub struct MerkleTree {
    leaves: BTreeMap<[u8; 32], Digest>,
}

/// A lookup branch: the leaf value (absent for non-inclusion), a bitmap of
/// the path levels whose sibling subtree is non-empty, and those siblings in
/// root-to-leaf order. Empty siblings are elided; the verifier regenerates
/// them from the per-height empty hashes.
#[derive(Serialize, Deserialize)]
struct LookupBranch {
    value: Option<Digest>,
    bitmap: [u8; 32],
    siblings: Vec<Digest>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the leaf at `index`, replacing any previous value.
    pub fn insert(&mut self, index: [u8; 32], leaf: Digest) {
        self.leaves.insert(index, leaf);
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// The root commitment over the current leaf set.
    pub fn root(&self) -> Digest {
        let empties = empty_hashes();
        let leaves: Vec<_> = self.leaves.iter().collect();
        subtree_hash(&leaves, 0, &empties)
    }

    /// Produce an opaque lookup proof for `index` (inclusion or
    /// non-inclusion) against the current root.
    pub fn prove(&self, index: &[u8; 32]) -> Vec<u8> {
        let empties = empty_hashes();
        let mut slice: Vec<_> = self.leaves.iter().collect();
        let mut bitmap = [0u8; 32];
        let mut siblings = Vec::new();

        for depth in 0..DEPTH {
            let split = slice
                .iter()
                .position(|(key, _)| bit(key, depth))
                .unwrap_or(slice.len());
            let (left, right) = slice.split_at(split);
            let (own, sibling) = if bit(index, depth) {
                (right, left)
            } else {
                (left, right)
            };
            if !sibling.is_empty() {
                set_bit(&mut bitmap, depth);
                siblings.push(subtree_hash(sibling, depth + 1, &empties));
            }
            slice = own.to_vec();
        }

        let value = slice.first().map(|(_, leaf)| **leaf);
        bincode::serialize(&LookupBranch {
            value,
            bitmap,
            siblings,
        })
        .expect("Failed to serialize tree proof")
    }
}

/// Check a lookup proof against a ratified root. Returns the proven leaf
/// digest, or `None` for a valid non-inclusion proof.
pub fn verify(root: &Digest, index: &[u8; 32], proof: &[u8]) -> Result<Option<Digest>, TreeError> {
    let branch: LookupBranch =
        bincode::deserialize(proof).map_err(|e| TreeError::DecodeError(e.to_string()))?;
    let expected = (0..DEPTH).filter(|depth| bit(&branch.bitmap, *depth)).count();
    if branch.siblings.len() != expected {
        return Err(TreeError::MalformedProof(format!(
            "{} siblings present, bitmap names {}",
            branch.siblings.len(),
            expected
        )));
    }

    let empties = empty_hashes();
    let mut supplied = branch.siblings.iter();
    let mut path = Vec::with_capacity(DEPTH);
    for depth in 0..DEPTH {
        if bit(&branch.bitmap, depth) {
            path.push(*supplied.next().unwrap());
        } else {
            // The sibling of the node at this depth is an empty subtree one
            // level further down.
            path.push(empties[DEPTH - depth - 1]);
        }
    }

    let mut accumulator = match &branch.value {
        Some(leaf) => leaf_hash(index, leaf),
        None => empties[0],
    };
    for depth in (0..DEPTH).rev() {
        accumulator = if bit(index, depth) {
            interior_hash(&path[depth], &accumulator)
        } else {
            interior_hash(&accumulator, &path[depth])
        };
    }

    if accumulator != *root {
        return Err(TreeError::RootMismatch);
    }
    Ok(branch.value)
}

/// Hash of the subtree rooted at `depth` covering the given (sorted) leaves.
fn subtree_hash(leaves: &[(&[u8; 32], &Digest)], depth: usize, empties: &[Digest]) -> Digest {
    if leaves.is_empty() {
        return empties[DEPTH - depth];
    }
    if depth == DEPTH {
        let (index, leaf) = leaves[0];
        return leaf_hash(index, leaf);
    }
    let split = leaves
        .iter()
        .position(|(key, _)| bit(key, depth))
        .unwrap_or(leaves.len());
    let left = subtree_hash(&leaves[..split], depth + 1, empties);
    let right = subtree_hash(&leaves[split..], depth + 1, empties);
    interior_hash(&left, &right)
}

/// Empty-subtree hashes by height: `empties[h]` covers `2^h` absent leaves.
fn empty_hashes() -> Vec<Digest> {
    let mut empties = Vec::with_capacity(DEPTH + 1);
    empties.push(Digest::default());
    for height in 1..=DEPTH {
        let below = empties[height - 1];
        empties.push(interior_hash(&below, &below));
    }
    empties
}

// Leaf and interior hashing are domain-separated.
fn leaf_hash(index: &[u8; 32], leaf: &Digest) -> Digest {
    let mut data = Vec::with_capacity(65);
    data.push(0x00);
    data.extend_from_slice(index);
    data.extend_from_slice(leaf.as_ref());
    Digest::of(&data)
}

fn interior_hash(left: &Digest, right: &Digest) -> Digest {
    let mut data = Vec::with_capacity(65);
    data.push(0x01);
    data.extend_from_slice(left.as_ref());
    data.extend_from_slice(right.as_ref());
    Digest::of(&data)
}

/// The `depth`-th bit of a 32-byte string, most significant first.
fn bit(bytes: &[u8; 32], depth: usize) -> bool {
    (bytes[depth / 8] >> (7 - depth % 8)) & 1 == 1
}

fn set_bit(bytes: &mut [u8; 32], depth: usize) {
    bytes[depth / 8] |= 1 << (7 - depth % 8);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(fill: u8) -> [u8; 32] {
        [fill; 32]
    }

    #[test]
    fn empty_tree_proves_non_inclusion() {
        let tree = MerkleTree::new();
        let root = tree.root();
        let proof = tree.prove(&index(42));
        assert_eq!(verify(&root, &index(42), &proof).unwrap(), None);
    }

    #[test]
    fn inclusion_round_trip() {
        let mut tree = MerkleTree::new();
        let leaf = Digest::of(b"entry bytes");
        tree.insert(index(1), leaf);
        tree.insert(index(2), Digest::of(b"other entry"));
        let root = tree.root();
        let proof = tree.prove(&index(1));
        assert_eq!(verify(&root, &index(1), &proof).unwrap(), Some(leaf));
    }

    #[test]
    fn non_inclusion_among_neighbors() {
        let mut tree = MerkleTree::new();
        for fill in [1u8, 2, 3, 200].iter() {
            tree.insert(index(*fill), Digest::of(&[*fill]));
        }
        let root = tree.root();
        let proof = tree.prove(&index(77));
        assert_eq!(verify(&root, &index(77), &proof).unwrap(), None);
    }

    #[test]
    fn replaced_leaf_changes_root() {
        let mut tree = MerkleTree::new();
        tree.insert(index(5), Digest::of(b"v1"));
        let old_root = tree.root();
        tree.insert(index(5), Digest::of(b"v2"));
        assert_ne!(tree.root(), old_root);
    }

    #[test]
    fn stale_proof_is_rejected() {
        let mut tree = MerkleTree::new();
        tree.insert(index(5), Digest::of(b"v1"));
        let proof = tree.prove(&index(5));
        tree.insert(index(9), Digest::of(b"unrelated"));
        let new_root = tree.root();
        assert!(matches!(
            verify(&new_root, &index(5), &proof),
            Err(TreeError::RootMismatch)
        ));
    }

    #[test]
    fn proof_for_wrong_index_is_rejected() {
        let mut tree = MerkleTree::new();
        tree.insert(index(5), Digest::of(b"v1"));
        let root = tree.root();
        let proof = tree.prove(&index(5));
        assert!(verify(&root, &index(6), &proof).is_err());
    }

    #[test]
    fn garbage_proof_is_rejected() {
        let tree = MerkleTree::new();
        let root = tree.root();
        assert!(matches!(
            verify(&root, &index(0), &[0xde, 0xad]),
            Err(TreeError::DecodeError(_))
        ));
    }
}
