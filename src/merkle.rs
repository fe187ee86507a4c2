//! Merkle digest tree over a transaction batch
//!
//! Leaves hold precomputed transaction hashes; every internal node hashes the
//! concatenation of its children. An odd row is padded by duplicating its
//! trailing element, at the leaf level and at every level above it, so the
//! pairing always comes out even. Nodes live in an arena and refer to each
//! other by index.

use crate::error::{ChainError, Result};
use crate::hash::Digest;
use sha2::{Digest as _, Sha256};

#[derive(Debug, Clone)]
pub struct MerkleNode {
    pub hash: Digest,
    pub parent: Option<usize>,
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl MerkleNode {
    fn leaf(hash: Digest) -> Self {
        MerkleNode {
            hash,
            parent: None,
            left: None,
            right: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: Vec<MerkleNode>,
    root: usize,
}

impl MerkleTree {
    /// Builds the tree over a batch of precomputed transaction hashes, in
    /// batch order. Identical ordered input always yields the identical root.
    pub fn build(tx_hashes: &[Digest]) -> Result<Self> {
        if tx_hashes.is_empty() {
            return Err(ChainError::NoTransactions);
        }

        let mut leaves: Vec<Digest> = tx_hashes.to_vec();
        if leaves.len() % 2 == 1 {
            leaves.push(*leaves.last().expect("non-empty leaf row"));
        }

        let mut nodes: Vec<MerkleNode> = leaves.into_iter().map(MerkleNode::leaf).collect();
        let mut level: Vec<usize> = (0..nodes.len()).collect();

        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().expect("non-empty level"));
            }

            let mut next_level = Vec::with_capacity(level.len() / 2);
            for pair in level.chunks(2) {
                let (left, right) = (pair[0], pair[1]);
                let hash = combine(&nodes[left].hash, &nodes[right].hash);
                let parent = nodes.len();
                nodes.push(MerkleNode {
                    hash,
                    parent: None,
                    left: Some(left),
                    right: Some(right),
                });
                nodes[left].parent = Some(parent);
                nodes[right].parent = Some(parent);
                next_level.push(parent);
            }
            level = next_level;
        }

        let root = level[0];
        Ok(MerkleTree { nodes, root })
    }

    pub fn root(&self) -> &MerkleNode {
        &self.nodes[self.root]
    }

    pub fn root_hash(&self) -> Digest {
        self.nodes[self.root].hash
    }

    pub fn node(&self, index: usize) -> Option<&MerkleNode> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth of the tree: 0 for a lone root, counting edges down to a leaf.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut index = self.root;
        while let Some(left) = self.nodes[index].left {
            depth += 1;
            index = left;
        }
        depth
    }
}

fn combine(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Digest::from_bytes(&hasher.finalize())
}
