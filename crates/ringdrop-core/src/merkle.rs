//! Keccak-256 Merkle codec for epoch allocations.
//!
//! - Leaf: `keccak256(owner(32) || index_le(4) || amount_le(8) || id_utf8)`
//! - Internal node: `keccak256(min(a, b) || max(a, b))`, children sorted as
//!   byte arrays, so proofs carry sibling hashes only (no side bits).
//!
//! Odd-length layers promote their last element unchanged. A single-leaf
//! tree has `root == leaf` and an empty proof. Empty trees produce
//! [`Hash256::ZERO`]; sealing rejects empty epochs before reaching here.

use crate::types::{Hash256, OwnerId, keccak_hashv};

/// Compute the leaf hash for one allocation.
pub fn leaf_hash(owner: &OwnerId, index: u32, amount: u64, id: &str) -> Hash256 {
    Hash256(keccak_hashv(&[
        owner.as_bytes(),
        &index.to_le_bytes(),
        &amount.to_le_bytes(),
        id.as_bytes(),
    ]))
}

/// Compute an internal node hash over two children in sorted order.
pub fn parent_hash(a: &Hash256, b: &Hash256) -> Hash256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    Hash256(keccak_hashv(&[lo.as_bytes(), hi.as_bytes()]))
}

/// Fold `proof` into `leaf` and compare against `root`.
pub fn verify_proof(leaf: &Hash256, proof: &[Hash256], root: &Hash256) -> bool {
    let computed = proof
        .iter()
        .fold(*leaf, |acc, sibling| parent_hash(&acc, sibling));
    computed == *root
}

/// Compute the next layer: adjacent pairs are hashed, a trailing odd element
/// is promoted as-is.
fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    layer
        .chunks(2)
        .map(|pair| match pair {
            [a, b] => parent_hash(a, b),
            [a] => *a,
            _ => unreachable!("chunks(2) yields one or two elements"),
        })
        .collect()
}

/// Full tree over leaf hashes, keeping every layer for proof extraction.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// `layers[0]` = leaves, `layers[last]` = `[root]`.
    layers: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build a tree from already-hashed leaves.
    pub fn from_leaves(leaves: &[Hash256]) -> Self {
        if leaves.is_empty() {
            return Self { layers: Vec::new() };
        }

        let mut layers = vec![leaves.to_vec()];
        let mut current = leaves.to_vec();
        while current.len() > 1 {
            current = next_layer(&current);
            layers.push(current.clone());
        }

        Self { layers }
    }

    /// The Merkle root. Returns [`Hash256::ZERO`] for an empty tree.
    pub fn root(&self) -> Hash256 {
        self.layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(Hash256::ZERO)
    }

    /// Number of leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        self.layers.first().map_or(0, Vec::len)
    }

    /// Number of layers above the leaves; an upper bound on proof length.
    pub fn depth(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    /// Sibling path for the leaf at `index`, bottom-up.
    ///
    /// Levels where the node was promoted without a sibling contribute
    /// nothing, so proofs in unbalanced trees can be shorter than
    /// [`depth`](Self::depth). Returns `None` if `index` is out of bounds.
    pub fn proof(&self, index: usize) -> Option<Vec<Hash256>> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut path = Vec::with_capacity(self.depth());
        let mut pos = index;
        for layer in &self.layers[..self.layers.len() - 1] {
            if let Some(sibling) = layer.get(pos ^ 1) {
                path.push(*sibling);
            }
            pos /= 2;
        }
        Some(path)
    }

    /// Proofs for every leaf, in leaf order.
    pub fn proofs(&self) -> Vec<Vec<Hash256>> {
        (0..self.leaf_count())
            .filter_map(|i| self.proof(i))
            .collect()
    }
}

/// Root of the tree over `leaves` without keeping intermediate layers.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }
    let mut current = leaves.to_vec();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    current[0]
}
